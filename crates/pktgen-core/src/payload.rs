//! UDP payload construction.
//!
//! Layout of a marker payload of body size `n` (default 1492):
//!
//! ```text
//! [0]        0x01 marker
//! [1..=8]    big-endian u64 milliseconds since the Unix epoch
//! [9..n]     zero
//! [n..n+16]  00 ff ff 00 fe fe fe fe fd fd fd fd 12 34 56 78
//! ```
//!
//! Random mode keeps the total length but fills every byte, marker, timestamp
//! and signature included, from the OS CSPRNG.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::PayloadError;

/// Marker byte opening every non-random payload
pub const PAYLOAD_MARKER: u8 = 0x01;

/// Signature appended after the payload body
pub const MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00, 0xfe, 0xfe, 0xfe, 0xfe, 0xfd, 0xfd, 0xfd, 0xfd, 0x12, 0x34, 0x56, 0x78,
];

/// Offset of the big-endian timestamp
pub const TIMESTAMP_OFFSET: usize = 1;

/// Smallest body that holds the marker and timestamp
pub const MIN_BODY_SIZE: usize = TIMESTAMP_OFFSET + 8;

/// How payload bytes are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadMode {
    /// Marker, build timestamp, zero fill, signature
    #[default]
    Timestamped,
    /// CSPRNG bytes throughout
    Random,
}

/// Immutable payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(Vec<u8>);

impl Payload {
    /// Build a payload with a body of `body_size` bytes plus the signature.
    pub fn new(body_size: usize, mode: PayloadMode) -> Result<Self, PayloadError> {
        match mode {
            PayloadMode::Timestamped => Self::timestamped_at(body_size, now_millis()),
            PayloadMode::Random => Self::random(body_size),
        }
    }

    /// Marker payload stamped with an explicit time.
    pub fn timestamped_at(body_size: usize, millis: u64) -> Result<Self, PayloadError> {
        check_size(body_size)?;
        let mut bytes = vec![0u8; body_size + MAGIC.len()];
        bytes[0] = PAYLOAD_MARKER;
        bytes[TIMESTAMP_OFFSET..MIN_BODY_SIZE].copy_from_slice(&millis.to_be_bytes());
        bytes[body_size..].copy_from_slice(&MAGIC);
        Ok(Self(bytes))
    }

    /// Payload of `body_size + 16` random bytes.
    pub fn random(body_size: usize) -> Result<Self, PayloadError> {
        check_size(body_size)?;
        let mut bytes = vec![0u8; body_size + MAGIC.len()];
        getrandom::getrandom(&mut bytes).map_err(PayloadError::Entropy)?;
        Ok(Self(bytes))
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Total length including the signature
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false: payloads carry at least the marker and signature
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Embedded timestamp, meaningful only for timestamped payloads
    pub fn timestamp_millis(&self) -> Option<u64> {
        let bytes: [u8; 8] = self.0.get(TIMESTAMP_OFFSET..MIN_BODY_SIZE)?.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }
}

fn check_size(body_size: usize) -> Result<(), PayloadError> {
    if body_size < MIN_BODY_SIZE {
        return Err(PayloadError::TooSmall {
            size: body_size,
            min: MIN_BODY_SIZE,
        });
    }
    Ok(())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_PAYLOAD_SIZE;

    #[test]
    fn test_timestamped_layout() {
        let payload = Payload::timestamped_at(DEFAULT_PAYLOAD_SIZE, 0x0102_0304_0506_0708).unwrap();
        let bytes = payload.as_bytes();

        assert_eq!(payload.len(), 1508);
        assert_eq!(bytes[0], PAYLOAD_MARKER);
        assert_eq!(&bytes[1..9], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(bytes[9..1492].iter().all(|&b| b == 0));
        assert_eq!(&bytes[1492..], &MAGIC);
        assert_eq!(payload.timestamp_millis(), Some(0x0102_0304_0506_0708));
    }

    #[test]
    fn test_builds_differ_only_in_timestamp() {
        let a = Payload::timestamped_at(DEFAULT_PAYLOAD_SIZE, 1_700_000_000_000).unwrap();
        let b = Payload::timestamped_at(DEFAULT_PAYLOAD_SIZE, 1_700_000_000_001).unwrap();

        let differing: Vec<usize> = a
            .as_bytes()
            .iter()
            .zip(b.as_bytes())
            .enumerate()
            .filter(|(_, (x, y))| x != y)
            .map(|(i, _)| i)
            .collect();
        assert!(!differing.is_empty());
        assert!(differing.iter().all(|i| (TIMESTAMP_OFFSET..MIN_BODY_SIZE).contains(i)));
    }

    #[test]
    fn test_new_uses_current_time() {
        let before = now_millis();
        let payload = Payload::new(DEFAULT_PAYLOAD_SIZE, PayloadMode::Timestamped).unwrap();
        let after = now_millis();

        let stamp = payload.timestamp_millis().unwrap();
        assert!(before <= stamp && stamp <= after);
    }

    #[test]
    fn test_random_payloads_differ() {
        let a = Payload::new(DEFAULT_PAYLOAD_SIZE, PayloadMode::Random).unwrap();
        let b = Payload::new(DEFAULT_PAYLOAD_SIZE, PayloadMode::Random).unwrap();

        assert_eq!(a.len(), 1508);
        assert_eq!(b.len(), 1508);
        assert_ne!(a, b);
    }

    #[test]
    fn test_random_overwrites_signature() {
        // 16 random bytes equal to the signature would be a 2^-128 event
        let payload = Payload::random(DEFAULT_PAYLOAD_SIZE).unwrap();
        assert_ne!(&payload.as_bytes()[1492..], &MAGIC);
    }

    #[test]
    fn test_minimum_size() {
        assert!(Payload::timestamped_at(MIN_BODY_SIZE, 7).is_ok());
        assert!(matches!(
            Payload::timestamped_at(MIN_BODY_SIZE - 1, 7),
            Err(PayloadError::TooSmall { size: 8, min: 9 })
        ));
        assert!(Payload::random(0).is_err());
    }
}
