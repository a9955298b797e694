//! Transmit engine.
//!
//! The engine owns the ring and a prebuilt frame and runs a busy loop on a
//! dedicated thread: read the free slot count, copy the frame into every free
//! slot, submit the batch, reap whatever completed. There is no pacing and no
//! blocking on completions.
//!
//! ```text
//!   Idle ──run()──▶ Running ──cancel / error──▶ Draining ──▶ Stopped
//! ```
//!
//! Consuming `run` drops the ring on every exit path, which is the single
//! release of its kernel resources.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use pktgen_transport::{TxDesc, TxRing};
use tracing::{debug, error, info};

use crate::error::EngineError;
use crate::frame::FrameTemplate;
use crate::shutdown::Shutdown;

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    /// Constructed, not yet running
    Idle = 0,
    /// Keeping the ring full
    Running = 1,
    /// No longer submitting
    Draining = 2,
    /// Loop exited
    Stopped = 3,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

/// Read-only view of an engine's state, usable from other threads.
#[derive(Debug, Clone)]
pub struct StateHandle(Arc<AtomicU8>);

impl StateHandle {
    /// Current state
    pub fn get(&self) -> EngineState {
        EngineState::from_u8(self.0.load(Ordering::Acquire))
    }
}

/// Work done by one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineReport {
    /// Loop iterations, including ones with no free slots
    pub iterations: u64,
    /// Non-empty batches submitted
    pub batches: u64,
    /// Frames handed to the ring
    pub frames_submitted: u64,
    /// Frames the ring reported as sent
    pub frames_completed: u64,
}

/// Keeps a [`TxRing`] full of copies of one frame until cancelled.
pub struct TransmitEngine<R: TxRing> {
    ring: R,
    template: FrameTemplate,
    shutdown: Shutdown,
    state: Arc<AtomicU8>,
}

impl<R: TxRing> TransmitEngine<R> {
    /// Create an idle engine
    pub fn new(ring: R, template: FrameTemplate, shutdown: Shutdown) -> Self {
        Self {
            ring,
            template,
            shutdown,
            state: Arc::new(AtomicU8::new(EngineState::Idle as u8)),
        }
    }

    /// Handle for observing the state from elsewhere
    pub fn state_handle(&self) -> StateHandle {
        StateHandle(Arc::clone(&self.state))
    }

    /// Current state
    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, next: EngineState) {
        let prev = self.state();
        self.state.store(next as u8, Ordering::Release);
        debug!(from = ?prev, to = ?next, "Engine state change");
    }

    /// Transmit until the shutdown signal fires or the ring fails.
    ///
    /// The ring is released when this returns, whatever the outcome.
    pub fn run(mut self) -> Result<EngineReport, EngineError> {
        let slot = self.ring.slot_size();
        if self.template.len() > slot {
            self.transition(EngineState::Stopped);
            return Err(EngineError::FrameTooLarge {
                frame: self.template.len(),
                slot,
            });
        }

        self.transition(EngineState::Running);
        info!(
            frame_len = self.template.len(),
            slot_size = slot,
            "Transmit engine running"
        );

        let mut report = EngineReport::default();
        let mut in_flight = 0usize;
        let outcome = self.pump(&mut report, &mut in_flight);

        self.transition(EngineState::Draining);
        if outcome.is_ok() && in_flight > 0 {
            // One last non-blocking sweep so the report reflects what finished
            match self.ring.reap(in_flight) {
                Ok(done) => report.frames_completed += done as u64,
                Err(e) => debug!(error = %e, "Final completion sweep failed"),
            }
        }
        self.transition(EngineState::Stopped);

        match &outcome {
            Ok(()) => info!(
                iterations = report.iterations,
                submitted = report.frames_submitted,
                completed = report.frames_completed,
                "Transmit engine stopped"
            ),
            Err(e) => {
                error!(error = %e, submitted = report.frames_submitted, "Transmit engine failed")
            }
        }
        outcome.map(|()| report)
    }

    fn pump(
        &mut self,
        report: &mut EngineReport,
        in_flight: &mut usize,
    ) -> Result<(), EngineError> {
        let frame = self.template.as_bytes();
        let ring = &mut self.ring;
        let mut descs: Vec<TxDesc> = Vec::new();

        while !self.shutdown.is_cancelled() {
            report.iterations += 1;

            let free = ring.free_slot_count();
            if free > 0 {
                descs.clear();
                ring.acquire(free, &mut descs);
                for desc in &mut descs {
                    ring.buffer_for(desc)?[..frame.len()].copy_from_slice(frame);
                    desc.len = frame.len() as u32;
                }

                let sent = ring.submit(&descs)?;
                *in_flight += sent;
                report.batches += 1;
                report.frames_submitted += sent as u64;
            }

            if *in_flight > 0 {
                let done = ring.reap(*in_flight)?;
                *in_flight -= done;
                report.frames_completed += done as u64;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{IpVersion, LinkAddresses};
    use crate::payload::Payload;
    use pktgen_transport::{MacAddr, MemoryRing, RingError, StatsSource};
    use std::sync::atomic::AtomicUsize;

    fn template() -> FrameTemplate {
        let addrs = LinkAddresses {
            src_mac: MacAddr::new([2, 0, 0, 0, 0, 1]),
            dst_mac: MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
            src_ip: "198.51.100.2".parse().unwrap(),
            dst_ip: "198.51.100.7".parse().unwrap(),
            src_port: 40000,
            dst_port: 9999,
        };
        let payload = Payload::timestamped_at(crate::DEFAULT_PAYLOAD_SIZE, 1).unwrap();
        FrameTemplate::build(&addrs, IpVersion::V4, payload.as_bytes()).unwrap()
    }

    /// Wraps a ring and fires the shutdown signal at a chosen point.
    struct Tripwire {
        inner: MemoryRing,
        shutdown: Shutdown,
        cancel_after_submits: Option<u64>,
        cancel_after_polls: Option<u64>,
        fail_submit: bool,
        submits: u64,
        polls: std::cell::Cell<u64>,
    }

    impl Tripwire {
        fn new(inner: MemoryRing, shutdown: Shutdown) -> Self {
            Self {
                inner,
                shutdown,
                cancel_after_submits: None,
                cancel_after_polls: None,
                fail_submit: false,
                submits: 0,
                polls: std::cell::Cell::new(0),
            }
        }
    }

    impl TxRing for Tripwire {
        type Stats = <MemoryRing as TxRing>::Stats;

        fn slot_size(&self) -> usize {
            self.inner.slot_size()
        }

        fn free_slot_count(&self) -> usize {
            let polls = self.polls.get() + 1;
            self.polls.set(polls);
            if self.cancel_after_polls == Some(polls) {
                self.shutdown.cancel();
            }
            self.inner.free_slot_count()
        }

        fn acquire(&mut self, count: usize, out: &mut Vec<TxDesc>) -> usize {
            self.inner.acquire(count, out)
        }

        fn buffer_for(&mut self, desc: &TxDesc) -> Result<&mut [u8], RingError> {
            self.inner.buffer_for(desc)
        }

        fn submit(&mut self, descs: &[TxDesc]) -> Result<usize, RingError> {
            if self.fail_submit {
                return Err(RingError::Submit("device gone".into()));
            }
            let sent = self.inner.submit(descs)?;
            self.submits += 1;
            if self.cancel_after_submits == Some(self.submits) {
                self.shutdown.cancel();
            }
            Ok(sent)
        }

        fn reap(&mut self, max: usize) -> Result<usize, RingError> {
            self.inner.reap(max)
        }

        fn stats_source(&self) -> Self::Stats {
            self.inner.stats_source()
        }
    }

    #[test]
    fn test_stops_within_one_iteration() {
        let shutdown = Shutdown::new();
        let ring = MemoryRing::new(16, 2048);
        let released = ring.release_counter();
        let counters = ring.counters();

        let mut tripwire = Tripwire::new(ring, shutdown.clone());
        tripwire.cancel_after_submits = Some(5);

        let report = TransmitEngine::new(tripwire, template(), shutdown)

            .run()

            .unwrap();
        assert_eq!(report.batches, 5);
        assert_eq!(report.iterations, 5);
        assert_eq!(counters.submitted(), report.frames_submitted);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_every_slot_gets_the_template() {
        let shutdown = Shutdown::new();
        let ring = MemoryRing::new(4, 2048);
        let mut tripwire = Tripwire::new(ring, shutdown.clone());
        tripwire.cancel_after_submits = Some(1);

        let report = TransmitEngine::new(tripwire, template(), shutdown)

            .run()

            .unwrap();

        assert_eq!(report.frames_submitted, 4);
        assert_eq!(report.frames_completed, 4);
    }

    #[test]
    fn test_busy_polls_when_ring_is_full() {
        let shutdown = Shutdown::new();
        let ring = MemoryRing::new(8, 2048).with_completion_limit(0);
        let mut tripwire = Tripwire::new(ring, shutdown.clone());
        tripwire.cancel_after_polls = Some(50);

        let report = TransmitEngine::new(tripwire, template(), shutdown)

            .run()

            .unwrap();
        assert_eq!(report.iterations, 50);
        assert_eq!(report.batches, 1);
        assert_eq!(report.frames_submitted, 8);
        assert_eq!(report.frames_completed, 0);
    }

    #[test]
    fn test_slow_completions_are_not_stranded() {
        let shutdown = Shutdown::new();
        let ring = MemoryRing::new(8, 2048).with_completion_limit(3);
        let counters = ring.counters();
        let mut tripwire = Tripwire::new(ring, shutdown.clone());
        tripwire.cancel_after_polls = Some(20);

        let report = TransmitEngine::new(tripwire, template(), shutdown)

            .run()

            .unwrap();
        assert!(report.batches > 1);
        assert_eq!(counters.completed(), report.frames_completed);
        assert!(report.frames_submitted - report.frames_completed <= 8);
    }

    #[test]
    fn test_submit_error_is_fatal_and_releases() {
        let shutdown = Shutdown::new();
        let ring = MemoryRing::new(4, 2048);
        let released = ring.release_counter();
        let mut tripwire = Tripwire::new(ring, shutdown.clone());
        tripwire.fail_submit = true;

        let err = TransmitEngine::new(tripwire, template(), shutdown)

            .run()

            .unwrap_err();
        assert!(matches!(err, EngineError::Ring(RingError::Submit(_))));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_frame_too_large() {
        let ring = MemoryRing::new(4, 512);
        let released = ring.release_counter();

        let engine = TransmitEngine::new(ring, template(), Shutdown::new());
        let state = engine.state_handle();
        assert_eq!(state.get(), EngineState::Idle);

        let err = engine.run().unwrap_err();
        assert!(matches!(
            err,
            EngineError::FrameTooLarge {
                frame: 1550,
                slot: 512,
            }
        ));
        assert_eq!(state.get(), EngineState::Stopped);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_already_cancelled_does_nothing() {
        let shutdown = Shutdown::new();
        shutdown.cancel();
        let ring = MemoryRing::new(4, 2048);
        let counters = ring.counters();

        let report = TransmitEngine::new(ring, template(), shutdown)

            .run()

            .unwrap();
        assert_eq!(report, EngineReport::default());
        assert_eq!(counters.submitted(), 0);
    }

    #[test]
    fn test_state_transitions() {
        let shutdown = Shutdown::new();
        let ring = MemoryRing::new(4, 2048);
        let mut tripwire = Tripwire::new(ring, shutdown.clone());
        tripwire.cancel_after_submits = Some(2);

        let engine = TransmitEngine::new(tripwire, template(), shutdown);
        let handle = engine.state_handle();
        assert_eq!(engine.state(), EngineState::Idle);

        engine.run().unwrap();
        assert_eq!(handle.get(), EngineState::Stopped);
    }

    #[test]
    fn test_runs_on_another_thread_until_cancelled() {
        let shutdown = Shutdown::new();
        let ring = MemoryRing::new(64, 2048);
        let stats = ring.stats_source();
        let released: Arc<AtomicUsize> = ring.release_counter();

        let engine = TransmitEngine::new(ring, template(), shutdown.clone());
        let handle = engine.state_handle();
        let worker = std::thread::spawn(move || engine.run());

        while stats.stats().unwrap().completed < 1000 {
            std::thread::yield_now();
        }
        assert_eq!(handle.get(), EngineState::Running);
        shutdown.cancel();

        let report = worker.join().unwrap().unwrap();
        assert!(report.frames_completed >= 1000);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(handle.get(), EngineState::Stopped);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Counters agree with the ring and never exceed its capacity
            #[test]
            fn report_matches_ring(slots in 1usize..32, limit in 1usize..8, polls in 1u64..64) {
                let shutdown = Shutdown::new();
                let ring = MemoryRing::new(slots, 2048).with_completion_limit(limit);
                let released = ring.release_counter();
                let counters = ring.counters();

                let mut tripwire = Tripwire::new(ring, shutdown.clone());
                tripwire.cancel_after_polls = Some(polls);
                let report = TransmitEngine::new(tripwire, template(), shutdown)
                    .run()
                    .unwrap();

                prop_assert_eq!(report.iterations, polls);
                prop_assert_eq!(counters.submitted(), report.frames_submitted);
                prop_assert_eq!(counters.completed(), report.frames_completed);
                let outstanding = report.frames_submitted - report.frames_completed;
                prop_assert!(outstanding <= slots as u64);
                prop_assert_eq!(released.load(Ordering::SeqCst), 1);
            }
        }
    }
}
