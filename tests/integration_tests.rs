//! Integration tests for pktgen
//!
//! Exercise resolution, frame building, the transmit engine and the
//! throughput reporter together over in-memory collaborators.

use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pktgen_core::{
    DEFAULT_PAYLOAD_SIZE, EngineError, EngineState, FrameTemplate, Payload, PayloadMode,
    ResolveError, Resolver, Shutdown, ThroughputReporter, TransmitEngine,
};
use pktgen_integration_tests::{
    FixedPort, GATEWAY_MAC, LOCAL_MAC, StaticTables, checksums_valid, udp_length,
};
use pktgen_transport::{MemoryRing, RingError, StatsSource, TxDesc, TxRing};

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

/// Ring that keeps a copy of every distinct frame it was handed.
struct RecordingRing {
    inner: MemoryRing,
    seen: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl RecordingRing {
    fn new(inner: MemoryRing) -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let ring = Self {
            inner,
            seen: Arc::clone(&seen),
        };
        (ring, seen)
    }
}

impl TxRing for RecordingRing {
    type Stats = <MemoryRing as TxRing>::Stats;

    fn slot_size(&self) -> usize {
        self.inner.slot_size()
    }

    fn free_slot_count(&self) -> usize {
        self.inner.free_slot_count()
    }

    fn acquire(&mut self, count: usize, out: &mut Vec<TxDesc>) -> usize {
        self.inner.acquire(count, out)
    }

    fn buffer_for(&mut self, desc: &TxDesc) -> Result<&mut [u8], RingError> {
        self.inner.buffer_for(desc)
    }

    fn submit(&mut self, descs: &[TxDesc]) -> Result<usize, RingError> {
        let mut seen = self.seen.lock().unwrap();
        for desc in descs {
            let bytes = self.inner.buffer_for(desc)?[..desc.len as usize].to_vec();
            if !seen.contains(&bytes) {
                seen.push(bytes);
            }
        }
        drop(seen);
        self.inner.submit(descs)
    }

    fn reap(&mut self, max: usize) -> Result<usize, RingError> {
        self.inner.reap(max)
    }

    fn stats_source(&self) -> Self::Stats {
        self.inner.stats_source()
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Gateway route: destination MAC comes from the gateway's neighbor entry.
#[test]
fn test_resolve_via_gateway() {
    let tables = StaticTables::with_gateway(3, ip("198.51.100.2"), ip("198.51.100.1"));
    let resolution = Resolver::new(&tables, FixedPort(40000))
        .resolve(ip("198.51.100.7"), 9999)
        .unwrap();

    let addrs = resolution.addresses;
    assert_eq!(addrs.dst_mac, GATEWAY_MAC);
    assert_eq!(addrs.src_mac, LOCAL_MAC);
    assert_eq!(addrs.src_ip, ip("198.51.100.2"));
    assert_eq!(addrs.dst_ip, ip("198.51.100.7"));
    assert_eq!(addrs.src_port, 40000);
    assert_eq!(addrs.dst_port, 9999);
    assert_eq!(resolution.ifindex, 3);
    assert_eq!(resolution.next_hop, ip("198.51.100.1"));
}

/// A next hop missing from the neighbor table aborts before any ring exists.
#[test]
fn test_unresolved_neighbor_aborts() {
    let mut tables = StaticTables::with_gateway(3, ip("198.51.100.2"), ip("198.51.100.1"));
    tables.neighbors.clear();

    let err = Resolver::new(&tables, FixedPort(40000))
        .resolve(ip("198.51.100.7"), 9999)
        .unwrap_err();
    let gateway = ip("198.51.100.1");
    assert!(matches!(
        err,
        ResolveError::NeighborNotFound { next_hop, ifindex: 3 } if next_hop == gateway
    ));
}

#[test]
fn test_empty_routing_table() {
    let tables = StaticTables::default();
    let err = Resolver::new(&tables, FixedPort(1))
        .resolve(ip("203.0.113.9"), 53)
        .unwrap_err();
    assert!(matches!(err, ResolveError::NoRoute(_)));
}

// ============================================================================
// Resolve -> build -> transmit
// ============================================================================

fn build_frame(tables: &StaticTables, dest: &str, mode: PayloadMode) -> FrameTemplate {
    let resolution = Resolver::new(tables, FixedPort(40000))
        .resolve(ip(dest), 9999)
        .unwrap();
    let addrs = resolution.addresses;
    let payload = Payload::new(DEFAULT_PAYLOAD_SIZE, mode).unwrap();
    FrameTemplate::build(&addrs, addrs.ip_version(), payload.as_bytes()).unwrap()
}

/// Every frame the ring sees is byte-identical to the template.
#[test]
fn test_pipeline_transmits_identical_frames() {
    let tables = StaticTables::with_gateway(3, ip("198.51.100.2"), ip("198.51.100.1"));
    let frame = build_frame(&tables, "198.51.100.7", PayloadMode::Timestamped);
    assert!(checksums_valid(frame.as_bytes()));
    assert_eq!(udp_length(frame.as_bytes()), 8 + 1508);

    let inner = MemoryRing::new(32, 2048);
    let released = inner.release_counter();
    let stats = inner.stats_source();
    let (ring, seen) = RecordingRing::new(inner);

    let shutdown = Shutdown::new();
    let engine = TransmitEngine::new(ring, frame.clone(), shutdown.clone());
    let state = engine.state_handle();
    let worker = std::thread::spawn(move || engine.run());

    while stats.stats().unwrap().completed < 10_000 {
        std::thread::yield_now();
    }
    shutdown.cancel();
    let report = worker.join().unwrap().unwrap();

    assert_eq!(state.get(), EngineState::Stopped);
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert!(report.frames_completed >= 10_000);
    assert!(report.frames_submitted >= report.frames_completed);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1, "all transmitted frames are identical");
    assert_eq!(seen[0], frame.as_bytes());
}

#[test]
fn test_pipeline_ipv6() {
    let tables = StaticTables::with_gateway(5, ip("2001:db8::2"), ip("fe80::1"));
    let frame = build_frame(&tables, "2001:db8:ffff::7", PayloadMode::Random);

    assert_eq!(frame.len(), 14 + 40 + 8 + 1508);
    assert!(checksums_valid(frame.as_bytes()));
    assert_eq!(&frame.as_bytes()[0..6], &GATEWAY_MAC.octets());
}

/// Random payloads still yield valid checksums and the same length.
#[test]
fn test_random_payload_frame() {
    let tables = StaticTables::with_gateway(3, ip("198.51.100.2"), ip("198.51.100.1"));
    let a = build_frame(&tables, "198.51.100.7", PayloadMode::Random);
    let b = build_frame(&tables, "198.51.100.7", PayloadMode::Random);

    assert_eq!(a.len(), b.len());
    assert_ne!(a, b);
    assert!(checksums_valid(a.as_bytes()));
    assert!(checksums_valid(b.as_bytes()));
}

/// A frame larger than a ring slot is rejected and the ring still released.
#[test]
fn test_frame_larger_than_slot() {
    let tables = StaticTables::with_gateway(3, ip("198.51.100.2"), ip("198.51.100.1"));
    let frame = build_frame(&tables, "198.51.100.7", PayloadMode::Timestamped);

    let ring = MemoryRing::new(8, 1024);
    let released = ring.release_counter();
    let err = TransmitEngine::new(ring, frame, Shutdown::new())
        .run()
        .unwrap_err();

    assert!(matches!(err, EngineError::FrameTooLarge { slot: 1024, .. }));
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Engine + reporter
// ============================================================================

/// Reporter samples are monotonic while the engine runs, and both stop on
/// one shutdown signal.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_engine_and_reporter_share_shutdown() {
    let tables = StaticTables::with_gateway(3, ip("198.51.100.2"), ip("198.51.100.1"));
    let frame = build_frame(&tables, "198.51.100.7", PayloadMode::Timestamped);
    let frame_len = frame.len();

    let ring = MemoryRing::new(256, 2048);
    let released = ring.release_counter();
    let shutdown = Shutdown::new();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let reporter = ThroughputReporter::new(ring.stats_source(), frame_len)
        .with_interval(Duration::from_millis(20));
    let reporter = tokio::spawn(reporter.run(shutdown.clone(), move |sample| {
        let _ = tx.send(sample);
    }));

    let engine = TransmitEngine::new(ring, frame, shutdown.clone());
    let engine = tokio::task::spawn_blocking(move || engine.run());

    let mut samples = Vec::new();
    while samples.len() < 3 {
        samples.push(rx.recv().await.unwrap());
    }
    shutdown.cancel();

    let report = engine.await.unwrap().unwrap();
    reporter.await.unwrap().unwrap();

    assert_eq!(released.load(Ordering::SeqCst), 1);
    for pair in samples.windows(2) {
        assert!(pair[0].completed <= pair[1].completed);
    }
    assert!(samples.iter().any(|s| s.rate.packets_per_sec > 0));
    assert!(samples.last().unwrap().completed <= report.frames_completed);
    for sample in &samples {
        let expected = sample.rate.packets_per_sec as u128 * frame_len as u128 * 8 / 1_000_000;
        assert_eq!(u128::from(sample.rate.megabits_per_sec), expected);
    }
}

/// A ring whose stats stop working ends the reporter, not the engine.
#[tokio::test]
async fn test_reporter_failure_is_isolated() {
    struct Broken;

    impl StatsSource for Broken {
        fn stats(&self) -> Result<pktgen_transport::RingStats, RingError> {
            Err(RingError::Closed)
        }
    }

    let shutdown = Shutdown::new();
    let result = ThroughputReporter::new(Broken, 1550)
        .run(shutdown.clone(), |_| {})
        .await;
    assert!(result.is_err());
    assert!(!shutdown.is_cancelled());
}
