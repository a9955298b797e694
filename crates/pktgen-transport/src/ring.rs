//! Transmit ring capability.
//!
//! [`TxRing`] is the narrow surface the transmit engine drives: ask for free
//! slots, fill their buffers, submit descriptors, reap completions. The
//! completion counter is shared through a [`StatsSource`] handle so a reporter
//! on another task can sample it while the engine owns the ring.
//!
//! [`MemoryRing`] is a heap-backed implementation used by tests and benchmarks.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use thiserror::Error;

/// Transmit ring errors
#[derive(Debug, Error)]
pub enum RingError {
    /// Descriptors could not be placed on the ring
    #[error("submit failed: {0}")]
    Submit(String),

    /// Completion ring could not be drained
    #[error("reap failed: {0}")]
    Reap(String),

    /// Descriptor does not name a slot of this ring
    #[error("invalid descriptor: addr={addr:#x}, len={len}")]
    InvalidDescriptor {
        /// Offset into the buffer region
        addr: u64,
        /// Frame length
        len: u32,
    },

    /// The ring behind a stats handle has been released
    #[error("ring closed")]
    Closed,

    /// Kernel statistics could not be read
    #[error("failed to read ring statistics: {0}")]
    Stats(#[source] std::io::Error),
}

/// TX descriptor naming one slot of the ring's buffer region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxDesc {
    /// Offset of the slot in the buffer region
    pub addr: u64,
    /// Length of the frame written into the slot
    pub len: u32,
}

/// Point-in-time ring counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    /// Descriptors handed to the ring
    pub submitted: u64,
    /// Descriptors the ring reported as transmitted
    pub completed: u64,
    /// Descriptors the kernel rejected
    pub tx_invalid_descs: u64,
    /// Times the kernel found the TX ring empty
    pub tx_ring_empty_descs: u64,
}

/// Thread-safe reader of a ring's counters.
pub trait StatsSource: Send + Sync + 'static {
    /// Read the current counters.
    fn stats(&self) -> Result<RingStats, RingError>;
}

/// A transmit ring the engine can keep full.
pub trait TxRing: Send {
    /// Stats handle type returned by [`TxRing::stats_source`]
    type Stats: StatsSource;

    /// Capacity of a single slot in bytes
    fn slot_size(&self) -> usize;

    /// Slots that can be acquired and submitted right now
    fn free_slot_count(&self) -> usize;

    /// Take up to `count` free slots, appending their descriptors to `out`.
    ///
    /// Returns the number acquired.
    fn acquire(&mut self, count: usize, out: &mut Vec<TxDesc>) -> usize;

    /// Writable buffer of an acquired slot
    fn buffer_for(&mut self, desc: &TxDesc) -> Result<&mut [u8], RingError>;

    /// Hand filled slots to the ring for transmission.
    fn submit(&mut self, descs: &[TxDesc]) -> Result<usize, RingError>;

    /// Return up to `max` completed slots to the free pool without blocking.
    fn reap(&mut self, max: usize) -> Result<usize, RingError>;

    /// Handle for sampling counters from another thread
    fn stats_source(&self) -> Self::Stats;
}

/// Cumulative submit/complete counters shared between a ring and its readers.
#[derive(Debug, Default)]
pub struct TxCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
}

impl TxCounters {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record submitted descriptors
    pub fn record_submitted(&self, count: u64) {
        self.submitted.fetch_add(count, Ordering::Relaxed);
    }

    /// Record completed descriptors
    pub fn record_completed(&self, count: u64) {
        self.completed.fetch_add(count, Ordering::Relaxed);
    }

    /// Total submitted
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Total completed
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Snapshot without kernel counters
    pub fn snapshot(&self) -> RingStats {
        RingStats {
            submitted: self.submitted(),
            completed: self.completed(),
            ..RingStats::default()
        }
    }
}

impl StatsSource for Arc<TxCounters> {
    fn stats(&self) -> Result<RingStats, RingError> {
        Ok(self.snapshot())
    }
}

/// Heap-backed ring that completes submitted frames on the next reap.
pub struct MemoryRing {
    slot_size: usize,
    region: Vec<u8>,
    free: Vec<u64>,
    in_flight: VecDeque<u64>,
    completion_limit: Option<usize>,
    last_submitted: Option<TxDesc>,
    counters: Arc<TxCounters>,
    released: Arc<AtomicUsize>,
}

impl MemoryRing {
    /// Create a ring of `slot_count` slots of `slot_size` bytes each.
    pub fn new(slot_count: usize, slot_size: usize) -> Self {
        let free = (0..slot_count)
            .rev()
            .map(|i| (i * slot_size) as u64)
            .collect();
        Self {
            slot_size,
            region: vec![0u8; slot_count * slot_size],
            free,
            in_flight: VecDeque::with_capacity(slot_count),
            completion_limit: None,
            last_submitted: None,
            counters: Arc::new(TxCounters::new()),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Complete at most `limit` frames per reap, simulating a slow NIC.
    pub fn with_completion_limit(mut self, limit: usize) -> Self {
        self.completion_limit = Some(limit);
        self
    }

    /// Shared counters of this ring
    pub fn counters(&self) -> Arc<TxCounters> {
        Arc::clone(&self.counters)
    }

    /// Counter incremented when the ring is dropped
    pub fn release_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.released)
    }

    /// Frames currently owned by the ring
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Bytes of the most recently submitted frame
    pub fn last_submitted(&self) -> Option<&[u8]> {
        let desc = self.last_submitted?;
        let start = desc.addr as usize;
        self.region.get(start..start + desc.len as usize)
    }

    fn check(&self, desc: &TxDesc) -> Result<usize, RingError> {
        let addr = desc.addr as usize;
        if addr % self.slot_size != 0 || addr + self.slot_size > self.region.len() {
            return Err(RingError::InvalidDescriptor {
                addr: desc.addr,
                len: desc.len,
            });
        }
        Ok(addr)
    }
}

impl TxRing for MemoryRing {
    type Stats = Arc<TxCounters>;

    fn slot_size(&self) -> usize {
        self.slot_size
    }

    fn free_slot_count(&self) -> usize {
        self.free.len()
    }

    fn acquire(&mut self, count: usize, out: &mut Vec<TxDesc>) -> usize {
        let n = count.min(self.free.len());
        for _ in 0..n {
            if let Some(addr) = self.free.pop() {
                out.push(TxDesc { addr, len: 0 });
            }
        }
        n
    }

    fn buffer_for(&mut self, desc: &TxDesc) -> Result<&mut [u8], RingError> {
        let start = self.check(desc)?;
        Ok(&mut self.region[start..start + self.slot_size])
    }

    fn submit(&mut self, descs: &[TxDesc]) -> Result<usize, RingError> {
        for desc in descs {
            self.check(desc)?;
            if desc.len == 0 || desc.len as usize > self.slot_size {
                return Err(RingError::InvalidDescriptor {
                    addr: desc.addr,
                    len: desc.len,
                });
            }
        }
        self.in_flight.extend(descs.iter().map(|d| d.addr));
        if let Some(last) = descs.last() {
            self.last_submitted = Some(*last);
        }
        self.counters.record_submitted(descs.len() as u64);
        Ok(descs.len())
    }

    fn reap(&mut self, max: usize) -> Result<usize, RingError> {
        let limit = self.completion_limit.unwrap_or(usize::MAX);
        let n = max.min(limit).min(self.in_flight.len());
        self.free.extend(self.in_flight.drain(..n));
        self.counters.record_completed(n as u64);
        Ok(n)
    }

    fn stats_source(&self) -> Self::Stats {
        self.counters()
    }
}

impl Drop for MemoryRing {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}
