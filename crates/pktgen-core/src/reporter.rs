//! Once-per-second throughput reporting.
//!
//! The reporter samples the ring's cumulative completion counter through a
//! [`StatsSource`] and turns consecutive samples into a rate. The first
//! interval is measured from whatever the counter held when the reporter
//! started, so it may be skewed.

use std::fmt;
use std::time::Duration;

use pktgen_transport::{RingStats, StatsSource};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, warn};

use crate::error::ReporterError;
use crate::shutdown::Shutdown;

/// Sampling period
pub const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Rate over one sampling interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Throughput {
    /// Frames completed during the interval
    pub packets_per_sec: u64,
    /// Megabits (10^6 bits) of frame data completed during the interval
    pub megabits_per_sec: u64,
}

impl Throughput {
    /// Rate between two cumulative completion counts one interval apart.
    ///
    /// A counter that went backwards yields zero rather than wrapping.
    pub fn between(previous: u64, current: u64, frame_len: usize) -> Self {
        let packets = current.saturating_sub(previous);
        let bits = u128::from(packets) * frame_len as u128 * 8;
        Self {
            packets_per_sec: packets,
            megabits_per_sec: u64::try_from(bits / 1_000_000).unwrap_or(u64::MAX),
        }
    }
}

impl fmt::Display for Throughput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} packets/s ({} Mb/s)",
            self.packets_per_sec, self.megabits_per_sec
        )
    }
}

/// One reporter tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThroughputSample {
    /// Cumulative completed count at this tick
    pub completed: u64,
    /// Rate since the previous tick
    pub rate: Throughput,
    /// Descriptors the kernel rejected since the previous tick
    pub invalid_descs: u64,
    /// Times the kernel found the TX ring empty since the previous tick
    pub ring_empty: u64,
}

/// Periodic sampler of a ring's completion counter.
pub struct ThroughputReporter<S: StatsSource> {
    stats: S,
    frame_len: usize,
    interval: Duration,
}

impl<S: StatsSource> ThroughputReporter<S> {
    /// Reporter for frames of `frame_len` bytes
    pub fn new(stats: S, frame_len: usize) -> Self {
        Self {
            stats,
            frame_len,
            interval: REPORT_INTERVAL,
        }
    }

    /// Override the sampling period
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sample until `shutdown` fires, handing each sample to `emit`.
    ///
    /// # Errors
    ///
    /// Returns [`ReporterError::Stats`] when the counter cannot be read. The
    /// transmit engine is unaffected.
    pub async fn run<F>(self, shutdown: Shutdown, mut emit: F) -> Result<(), ReporterError>
    where
        F: FnMut(ThroughputSample),
    {
        let mut previous = self.stats.stats()?;
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(baseline = previous.completed, "Throughput reporter started");

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    debug!("Throughput reporter stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let current = match self.stats.stats() {
                        Ok(stats) => stats,
                        Err(e) => {
                            warn!(error = %e, "Throughput reporter stopped");
                            return Err(e.into());
                        }
                    };
                    emit(self.sample(&previous, &current));
                    previous = current;
                }
            }
        }
    }
}

impl<S: StatsSource> ThroughputReporter<S> {
    fn sample(&self, previous: &RingStats, current: &RingStats) -> ThroughputSample {
        let invalid_descs = current
            .tx_invalid_descs
            .saturating_sub(previous.tx_invalid_descs);
        let ring_empty = current
            .tx_ring_empty_descs
            .saturating_sub(previous.tx_ring_empty_descs);

        if invalid_descs > 0 {
            warn!(
                rejected = invalid_descs,
                total = current.tx_invalid_descs,
                "Kernel rejected TX descriptors"
            );
        }
        if ring_empty > 0 {
            debug!(ring_empty, "TX ring ran dry");
        }

        ThroughputSample {
            completed: current.completed,
            rate: Throughput::between(previous.completed, current.completed, self.frame_len),
            invalid_descs,
            ring_empty,
        }
    }
}
