//! Configuration file for the pktgen CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use pktgen_core::IpVersion;
use pktgen_core::frame::max_payload_len;
use pktgen_core::payload::{MAGIC, MIN_BODY_SIZE};
#[cfg(target_os = "linux")]
use pktgen_transport::{BindMode, RingConfig};

/// pktgen configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    /// AF_XDP ring geometry
    #[serde(default)]
    pub ring: RingSection,
    /// Payload shape
    #[serde(default)]
    pub payload: PayloadSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// AF_XDP ring section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RingSection {
    /// NIC queue to bind
    #[serde(default)]
    pub queue_id: u32,
    /// UMEM frame size in bytes
    #[serde(default = "default_frame_size")]
    pub frame_size: u32,
    /// Number of UMEM frames
    #[serde(default = "default_frame_count")]
    pub frame_count: u32,
    /// TX ring entries
    #[serde(default = "default_ring_size")]
    pub tx_ring_size: u32,
    /// Completion ring entries
    #[serde(default = "default_ring_size")]
    pub comp_ring_size: u32,
    /// Fill ring entries
    #[serde(default = "default_ring_size")]
    pub fill_ring_size: u32,
    /// auto, copy or zerocopy
    #[serde(default = "default_bind_mode")]
    pub bind_mode: String,
    /// Use the need-wakeup protocol
    #[serde(default = "default_true")]
    pub need_wakeup: bool,
}

/// Payload section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PayloadSection {
    /// Body length before the 16-byte signature
    #[serde(default = "default_payload_size")]
    pub size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_frame_size() -> u32 {
    2048
}

fn default_frame_count() -> u32 {
    4096
}

fn default_ring_size() -> u32 {
    2048
}

fn default_bind_mode() -> String {
    "auto".to_string()
}

fn default_true() -> bool {
    true
}

fn default_payload_size() -> usize {
    pktgen_core::DEFAULT_PAYLOAD_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RingSection {
    fn default() -> Self {
        Self {
            queue_id: 0,
            frame_size: default_frame_size(),
            frame_count: default_frame_count(),
            tx_ring_size: default_ring_size(),
            comp_ring_size: default_ring_size(),
            fill_ring_size: default_ring_size(),
            bind_mode: default_bind_mode(),
            need_wakeup: true,
        }
    }
}

impl Default for PayloadSection {
    fn default() -> Self {
        Self {
            size: default_payload_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("pktgen/config.toml")
    }

    /// Load an explicit file, else the default file if present, else defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit path is missing or any file fails to
    /// parse.
    pub fn resolve(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path)
                .map_err(|e| anyhow::anyhow!("Failed to load config {}: {e}", path.display()));
        }

        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let ring = &self.ring;

        let frame_size = ring.frame_size;
        if !frame_size.is_power_of_two() || frame_size < 2048 {
            anyhow::bail!("Frame size must be a power of 2 and at least 2048, got {frame_size}");
        }

        if ring.frame_count == 0 {
            anyhow::bail!("Frame count must be non-zero");
        }

        for (name, size) in [
            ("tx_ring_size", ring.tx_ring_size),
            ("comp_ring_size", ring.comp_ring_size),
            ("fill_ring_size", ring.fill_ring_size),
        ] {
            if !size.is_power_of_two() {
                anyhow::bail!("{name} must be a power of 2, got {size}");
            }
        }

        let valid_modes = ["auto", "copy", "zerocopy", "zero-copy"];
        if !valid_modes.contains(&ring.bind_mode.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid bind mode: {}. Must be one of: auto, copy, zerocopy",
                ring.bind_mode
            );
        }

        let size = self.payload.size;
        let min = MIN_BODY_SIZE;
        let max = max_payload_len(IpVersion::V4) - MAGIC.len();
        if size < min || size > max {
            anyhow::bail!("Payload size must be between {min} and {max}, got {size}");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Ring geometry for `AfXdpRing::open`
    ///
    /// # Errors
    ///
    /// Returns an error if the bind mode is not recognised.
    #[cfg(target_os = "linux")]
    pub fn ring_config(&self) -> anyhow::Result<RingConfig> {
        let bind_mode: BindMode = self.ring.bind_mode.parse()?;
        Ok(RingConfig {
            frame_size: self.ring.frame_size,
            frame_count: self.ring.frame_count,
            tx_ring_size: self.ring.tx_ring_size,
            comp_ring_size: self.ring.comp_ring_size,
            fill_ring_size: self.ring.fill_ring_size,
            bind_mode,
            need_wakeup: self.ring.need_wakeup,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.ring.queue_id, 0);
        assert_eq!(config.ring.frame_size, 2048);
        assert_eq!(config.ring.tx_ring_size, 2048);
        assert_eq!(config.payload.size, 1492);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.ring.frame_size = 3000;
        assert!(config.validate().is_err());

        config.ring.frame_size = 1024;
        assert!(config.validate().is_err());

        config.ring.frame_size = 2048;
        config.ring.tx_ring_size = 1000;
        assert!(config.validate().is_err());

        config.ring.tx_ring_size = 1024;
        config.ring.bind_mode = "turbo".to_string();
        assert!(config.validate().is_err());

        config.ring.bind_mode = "ZeroCopy".to_string();
        assert!(config.validate().is_ok());

        config.payload.size = 8;
        assert!(config.validate().is_err());

        config.payload.size = 9;
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [ring]
            queue_id = 3
            bind_mode = "copy"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.ring.queue_id, 3);
        assert_eq!(config.ring.bind_mode, "copy");
        assert_eq!(config.ring.frame_count, 4096);
        assert!(config.ring.need_wakeup);
        assert_eq!(config.payload.size, 1492);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_toml_serialization() {
        let mut config = Config::default();
        config.ring.queue_id = 7;
        config.payload.size = 64;

        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[payload]\nsize = 100").unwrap();

        let config = Config::resolve(Some(file.path())).unwrap();
        assert_eq!(config.payload.size, 100);
        assert_eq!(config.ring, RingSection::default());
    }

    #[test]
    fn test_explicit_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = Config::resolve(Some(&missing)).unwrap_err();
        assert!(err.to_string().contains("nope.toml"));
    }

    #[test]
    fn test_malformed_file_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[ring]\nframe_size = \"big\"").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_ring_config() {
        let mut config = Config::default();
        config.ring.bind_mode = "zero-copy".to_string();
        config.ring.need_wakeup = false;

        let ring = config.ring_config().unwrap();
        assert_eq!(ring.bind_mode, BindMode::ZeroCopy);
        assert!(!ring.need_wakeup);
        assert_eq!(ring.frame_count, 4096);
        assert!(ring.validate().is_ok());
    }
}
