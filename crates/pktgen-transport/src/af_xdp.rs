//! AF_XDP transmit ring for pktgen.
//!
//! This module opens a transmit-only AF_XDP socket: a UMEM region of
//! fixed-size frames, a fill ring (required by the kernel, never populated),
//! a completion ring and a TX ring. No RX ring is created and no XDP program
//! is attached, since pktgen never receives.
//!
//! ## Ownership
//!
//! Every kernel resource is held by an RAII wrapper, so a failed `open`
//! releases whatever was already acquired and dropping an [`AfXdpRing`]
//! releases everything exactly once: ring mappings first, then the socket,
//! then the UMEM.
//!
//! ## Requirements
//!
//! - Linux kernel 5.4+ with AF_XDP support (older kernels work without
//!   need-wakeup)
//! - `CAP_NET_RAW` (and `CAP_NET_ADMIN` for zero-copy on most drivers)
//! - Sufficient locked memory limit (ulimit -l), otherwise UMEM is unpinned
//!
//! ## Example
//!
//! ```no_run
//! use pktgen_transport::af_xdp::{AfXdpRing, RingConfig};
//! use pktgen_transport::ring::TxRing;
//!
//! let mut ring = AfXdpRing::open(2, 0, &RingConfig::default()).unwrap();
//! let mut descs = Vec::new();
//! let free = ring.free_slot_count();
//! ring.acquire(free, &mut descs);
//! ```

use std::fmt;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ring::{RingError, RingStats, StatsSource, TxCounters, TxDesc, TxRing};

// linux/if_xdp.h
const SOL_XDP: libc::c_int = 283;
const XDP_MMAP_OFFSETS: libc::c_int = 1;
const XDP_TX_RING: libc::c_int = 3;
const XDP_UMEM_REG: libc::c_int = 4;
const XDP_UMEM_FILL_RING: libc::c_int = 5;
const XDP_UMEM_COMPLETION_RING: libc::c_int = 6;
const XDP_STATISTICS: libc::c_int = 7;

const XDP_PGOFF_TX_RING: libc::off_t = 0x8000_0000;
const XDP_UMEM_PGOFF_COMPLETION_RING: libc::off_t = 0x1_8000_0000;

const XDP_COPY: u16 = 1 << 1;
const XDP_ZEROCOPY: u16 = 1 << 2;
const XDP_USE_NEED_WAKEUP: u16 = 1 << 3;

const XDP_RING_NEED_WAKEUP: u32 = 1 << 0;

const XDP_UMEM_MIN_CHUNK_SIZE: u32 = 2048;

/// AF_XDP errors
#[derive(Debug, Error)]
pub enum AfXdpError {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to create UMEM
    #[error("Failed to create UMEM: {0}")]
    UmemCreation(#[source] io::Error),

    /// Failed to create socket
    #[error("Failed to create AF_XDP socket: {0}")]
    SocketCreation(#[source] io::Error),

    /// A socket option was rejected
    #[error("{option} failed: {source}")]
    SocketOption {
        /// Option name
        option: &'static str,
        /// Kernel error
        #[source]
        source: io::Error,
    },

    /// Failed to map a ring into userspace
    #[error("Failed to mmap {ring} ring: {source}")]
    RingMap {
        /// Ring name
        ring: &'static str,
        /// Kernel error
        #[source]
        source: io::Error,
    },

    /// Failed to bind socket
    #[error("Failed to bind AF_XDP socket to ifindex {ifindex} queue {queue_id}: {source}")]
    SocketBind {
        /// Interface index
        ifindex: u32,
        /// NIC queue
        queue_id: u32,
        /// Kernel error
        #[source]
        source: io::Error,
    },
}

/// How the socket attaches to the NIC queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BindMode {
    /// Let the kernel pick zero-copy when the driver supports it
    #[default]
    Auto,
    /// Force copy mode
    Copy,
    /// Require zero-copy, failing the bind otherwise
    ZeroCopy,
}

impl BindMode {
    fn flags(self) -> u16 {
        match self {
            Self::Auto => 0,
            Self::Copy => XDP_COPY,
            Self::ZeroCopy => XDP_ZEROCOPY,
        }
    }
}

impl fmt::Display for BindMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::Copy => "copy",
            Self::ZeroCopy => "zerocopy",
        })
    }
}

impl FromStr for BindMode {
    type Err = AfXdpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "copy" => Ok(Self::Copy),
            "zerocopy" | "zero-copy" => Ok(Self::ZeroCopy),
            other => Err(AfXdpError::InvalidConfig(format!(
                "unknown bind mode {other:?} (expected auto, copy or zerocopy)"
            ))),
        }
    }
}

/// UMEM and ring geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingConfig {
    /// Size of each UMEM frame (power of 2, 2048..=page size)
    pub frame_size: u32,
    /// Number of UMEM frames
    pub frame_count: u32,
    /// TX ring entries (power of 2)
    pub tx_ring_size: u32,
    /// Completion ring entries (power of 2)
    pub comp_ring_size: u32,
    /// Fill ring entries (power of 2)
    pub fill_ring_size: u32,
    /// Copy / zero-copy selection
    pub bind_mode: BindMode,
    /// Only kick the kernel when it asks for it
    pub need_wakeup: bool,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            frame_size: 2048,
            frame_count: 4096,
            tx_ring_size: 2048,
            comp_ring_size: 2048,
            fill_ring_size: 2048,
            bind_mode: BindMode::Auto,
            need_wakeup: true,
        }
    }
}

impl RingConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), AfXdpError> {
        if !self.frame_size.is_power_of_two() {
            return Err(AfXdpError::InvalidConfig("frame_size must be power of 2".into()));
        }

        if self.frame_size < XDP_UMEM_MIN_CHUNK_SIZE {
            return Err(AfXdpError::InvalidConfig(format!(
                "frame_size must be >= {XDP_UMEM_MIN_CHUNK_SIZE}"
            )));
        }

        if self.frame_size as usize > page_size() {
            return Err(AfXdpError::InvalidConfig(format!(
                "frame_size must be <= page size ({})",
                page_size()
            )));
        }

        if self.frame_count == 0 {
            return Err(AfXdpError::InvalidConfig("frame_count must be non-zero".into()));
        }

        for (name, size) in [
            ("tx_ring_size", self.tx_ring_size),
            ("comp_ring_size", self.comp_ring_size),
            ("fill_ring_size", self.fill_ring_size),
        ] {
            if !size.is_power_of_two() {
                return Err(AfXdpError::InvalidConfig(format!("{name} must be power of 2")));
            }
        }

        if self.umem_size().is_none() {
            return Err(AfXdpError::InvalidConfig("UMEM size overflows".into()));
        }

        Ok(())
    }

    /// Total UMEM size in bytes
    pub fn umem_size(&self) -> Option<usize> {
        (self.frame_size as usize).checked_mul(self.frame_count as usize)
    }

    fn bind_flags(&self) -> u16 {
        let mut flags = self.bind_mode.flags();
        if self.need_wakeup {
            flags |= XDP_USE_NEED_WAKEUP;
        }
        flags
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default, Clone, Copy)]
struct XdpRingOffset {
    producer: u64,
    consumer: u64,
    desc: u64,
    flags: u64,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default, Clone, Copy)]
struct XdpMmapOffsets {
    rx: XdpRingOffset,
    tx: XdpRingOffset,
    fr: XdpRingOffset,
    cr: XdpRingOffset,
}

/// Pre-5.4 layout without the ring flags word
#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default, Clone, Copy)]
struct XdpRingOffsetV1 {
    producer: u64,
    consumer: u64,
    desc: u64,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default, Clone, Copy)]
struct XdpMmapOffsetsV1 {
    rx: XdpRingOffsetV1,
    tx: XdpRingOffsetV1,
    fr: XdpRingOffsetV1,
    cr: XdpRingOffsetV1,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default, Clone, Copy)]
struct XdpUmemReg {
    addr: u64,
    len: u64,
    chunk_size: u32,
    headroom: u32,
    flags: u32,
    tx_metadata_len: u32,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default, Clone, Copy)]
struct SockaddrXdp {
    sxdp_family: u16,
    sxdp_flags: u16,
    sxdp_ifindex: u32,
    sxdp_queue_id: u32,
    sxdp_shared_umem_fd: u32,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default, Clone, Copy)]
struct XdpDesc {
    addr: u64,
    len: u32,
    options: u32,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default, Clone, Copy)]
struct XdpStatistics {
    rx_dropped: u64,
    rx_invalid_descs: u64,
    tx_invalid_descs: u64,
    rx_ring_full: u64,
    rx_fill_ring_empty_descs: u64,
    tx_ring_empty_descs: u64,
}

/// Ring offsets normalised across kernel versions.
#[derive(Debug, Clone, Copy)]
struct RingOffsets {
    producer: u64,
    consumer: u64,
    desc: u64,
    flags: Option<u64>,
}

/// Page-aligned anonymous mapping holding the frames.
struct Umem {
    area: NonNull<u8>,
    size: usize,
    locked: bool,
}

impl Umem {
    fn new(size: usize) -> Result<Self, AfXdpError> {
        // SAFETY: anonymous private mapping, the result is checked for MAP_FAILED
        let area = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE,
                -1,
                0,
            )
        };
        if area == libc::MAP_FAILED {
            return Err(AfXdpError::UmemCreation(io::Error::last_os_error()));
        }
        let area = NonNull::new(area.cast::<u8>())
            .ok_or_else(|| AfXdpError::UmemCreation(io::Error::other("mmap returned null")))?;

        // SAFETY: area is a live mapping of exactly size bytes
        let locked = unsafe { libc::mlock(area.as_ptr().cast(), size) } == 0;
        if !locked {
            warn!(
                size,
                error = %io::Error::last_os_error(),
                "Failed to lock UMEM (check ulimit -l), continuing unpinned"
            );
        }

        Ok(Self { area, size, locked })
    }

    fn addr(&self) -> u64 {
        self.area.as_ptr() as u64
    }

    /// Frame starting at `offset`, `len` bytes long. Caller checks bounds.
    fn frame_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.size);
        // SAFETY: the mapping is valid for self.size bytes and the range is in
        // bounds; &mut self prevents aliasing from this side
        unsafe { std::slice::from_raw_parts_mut(self.area.as_ptr().add(offset), len) }
    }
}

impl Drop for Umem {
    fn drop(&mut self) {
        // SAFETY: area/size come from the successful mmap in Umem::new
        unsafe {
            if self.locked {
                libc::munlock(self.area.as_ptr().cast(), self.size);
            }
            libc::munmap(self.area.as_ptr().cast(), self.size);
        }
    }
}

/// One kernel ring mapped into userspace.
struct MmapRing {
    area: NonNull<u8>,
    mmap_size: usize,
    producer: NonNull<AtomicU32>,
    consumer: NonNull<AtomicU32>,
    flags: Option<NonNull<AtomicU32>>,
    desc: NonNull<u8>,
    size: u32,
    /// Our side of the ring: producer index for TX, consumer index for completion
    cached: u32,
}

impl MmapRing {
    fn map(
        socket: &OwnedFd,
        ring: &'static str,
        pgoff: libc::off_t,
        offsets: RingOffsets,
        entries: u32,
        entry_size: usize,
    ) -> Result<Self, AfXdpError> {
        let mmap_size = offsets.desc as usize + entries as usize * entry_size;
        // SAFETY: shared mapping of the socket's ring at the kernel-defined
        // page offset, checked for MAP_FAILED
        let area = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                socket.as_raw_fd(),
                pgoff,
            )
        };
        if area == libc::MAP_FAILED {
            return Err(AfXdpError::RingMap {
                ring,
                source: io::Error::last_os_error(),
            });
        }
        let area = NonNull::new(area.cast::<u8>()).ok_or_else(|| AfXdpError::RingMap {
            ring,
            source: io::Error::other("mmap returned null"),
        })?;

        // SAFETY: every offset was reported by the kernel for this mapping
        let at = |off: u64| unsafe { NonNull::new_unchecked(area.as_ptr().add(off as usize)) };
        let producer = at(offsets.producer).cast::<AtomicU32>();
        let consumer = at(offsets.consumer).cast::<AtomicU32>();

        let mut mapped = Self {
            area,
            mmap_size,
            producer,
            consumer,
            flags: offsets.flags.map(|off| at(off).cast::<AtomicU32>()),
            desc: at(offsets.desc),
            size: entries,
            cached: 0,
        };
        mapped.cached = if pgoff == XDP_PGOFF_TX_RING {
            mapped.producer().load(Ordering::Relaxed)
        } else {
            mapped.consumer().load(Ordering::Relaxed)
        };
        debug!(ring, entries, mmap_size, "AF_XDP ring mapped");
        Ok(mapped)
    }

    fn producer(&self) -> &AtomicU32 {
        // SAFETY: points into the live mapping, u32-aligned per the kernel ABI
        unsafe { self.producer.as_ref() }
    }

    fn consumer(&self) -> &AtomicU32 {
        // SAFETY: as for producer
        unsafe { self.consumer.as_ref() }
    }

    fn mask(&self) -> u32 {
        self.size - 1
    }

    /// Entries we may still produce (TX side)
    fn free_entries(&self) -> u32 {
        let cons = self.consumer().load(Ordering::Acquire);
        self.size - self.cached.wrapping_sub(cons)
    }

    /// Entries ready to consume (completion side)
    fn ready_entries(&self) -> u32 {
        self.producer()
            .load(Ordering::Acquire)
            .wrapping_sub(self.cached)
    }

    /// Kernel wants a `sendto` kick. Kernels without ring flags always do.
    fn needs_wakeup(&self) -> bool {
        match self.flags {
            Some(flags) => {
                // SAFETY: points into the live mapping
                let flags = unsafe { flags.as_ref() };
                flags.load(Ordering::Relaxed) & XDP_RING_NEED_WAKEUP != 0
            }
            None => true,
        }
    }

    fn write_tx(&mut self, index: u32, desc: XdpDesc) {
        let slot = (index & self.mask()) as usize;
        // SAFETY: slot < size and the descriptor area holds size XdpDesc entries
        unsafe { self.desc.cast::<XdpDesc>().as_ptr().add(slot).write_volatile(desc) }
    }

    fn read_comp(&self, index: u32) -> u64 {
        let slot = (index & self.mask()) as usize;
        // SAFETY: slot < size and the descriptor area holds size u64 entries
        unsafe { self.desc.cast::<u64>().as_ptr().add(slot).read_volatile() }
    }
}

impl Drop for MmapRing {
    fn drop(&mut self) {
        // SAFETY: area/mmap_size come from the successful mmap in MmapRing::map
        unsafe {
            libc::munmap(self.area.as_ptr().cast(), self.mmap_size);
        }
    }
}

/// Transmit-only AF_XDP socket with its UMEM and rings.
///
/// Field order is drop order: rings are unmapped before the socket closes,
/// and the UMEM outlives both.
pub struct AfXdpRing {
    tx: MmapRing,
    comp: MmapRing,
    socket: Arc<OwnedFd>,
    umem: Umem,
    frame_size: u32,
    need_wakeup: bool,
    free_frames: Vec<u64>,
    outstanding: u32,
    counters: Arc<TxCounters>,
    ifindex: u32,
    queue_id: u32,
}

// SAFETY: the raw mappings are owned exclusively by this value and only
// touched through &mut self or atomics
unsafe impl Send for AfXdpRing {}

impl AfXdpRing {
    /// Create a UMEM, an AF_XDP socket and its rings, and bind to a NIC queue.
    ///
    /// # Errors
    ///
    /// Any failure releases the resources acquired so far and is returned as
    /// an [`AfXdpError`] naming the step.
    pub fn open(ifindex: u32, queue_id: u32, config: &RingConfig) -> Result<Self, AfXdpError> {
        config.validate()?;
        let umem_size = config
            .umem_size()
            .ok_or_else(|| AfXdpError::InvalidConfig("UMEM size overflows".into()))?;

        let umem = Umem::new(umem_size)?;
        let socket = create_socket()?;

        register_umem(&socket, &umem, config.frame_size)?;
        set_ring_size(
            &socket,
            XDP_UMEM_FILL_RING,
            "XDP_UMEM_FILL_RING",
            config.fill_ring_size,
        )?;
        set_ring_size(
            &socket,
            XDP_UMEM_COMPLETION_RING,
            "XDP_UMEM_COMPLETION_RING",
            config.comp_ring_size,
        )?;
        set_ring_size(&socket, XDP_TX_RING, "XDP_TX_RING", config.tx_ring_size)?;

        let (tx_off, comp_off) = mmap_offsets(&socket)?;
        let need_wakeup = config.need_wakeup && tx_off.flags.is_some();
        if config.need_wakeup && !need_wakeup {
            warn!("Kernel does not expose ring flags, kicking on every submit");
        }

        let comp = MmapRing::map(
            &socket,
            "completion",
            XDP_UMEM_PGOFF_COMPLETION_RING,
            comp_off,
            config.comp_ring_size,
            mem::size_of::<u64>(),
        )?;
        let tx = MmapRing::map(
            &socket,
            "tx",
            XDP_PGOFF_TX_RING,
            tx_off,
            config.tx_ring_size,
            mem::size_of::<XdpDesc>(),
        )?;

        let mut flags = config.bind_flags();
        if !need_wakeup {
            flags &= !XDP_USE_NEED_WAKEUP;
        }
        bind_socket(&socket, ifindex, queue_id, flags)?;

        let free_frames = (0..config.frame_count)
            .rev()
            .map(|i| u64::from(i) * u64::from(config.frame_size))
            .collect();

        info!(
            ifindex,
            queue_id,
            frames = config.frame_count,
            frame_size = config.frame_size,
            tx_ring = config.tx_ring_size,
            mode = %config.bind_mode,
            need_wakeup,
            "AF_XDP ring opened"
        );

        Ok(Self {
            tx,
            comp,
            socket: Arc::new(socket),
            umem,
            frame_size: config.frame_size,
            need_wakeup,
            free_frames,
            outstanding: 0,
            counters: Arc::new(TxCounters::new()),
            ifindex,
            queue_id,
        })
    }

    fn frame_offset(&self, addr: u64, len: u32) -> Result<usize, RingError> {
        let offset = addr as usize;
        let end = offset + self.frame_size as usize;
        if addr % u64::from(self.frame_size) != 0 || end > self.umem.size {
            return Err(RingError::InvalidDescriptor { addr, len });
        }
        Ok(offset)
    }

    /// Ring the TX doorbell.
    fn kick(&self) -> Result<(), RingError> {
        // SAFETY: zero-length sendto on our own socket with null buffers is the
        // documented AF_XDP TX trigger
        let ret = unsafe {
            libc::sendto(
                self.socket.as_raw_fd(),
                ptr::null(),
                0,
                libc::MSG_DONTWAIT,
                ptr::null(),
                0,
            )
        };
        if ret >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            // Transient: the kernel is still busy with earlier descriptors
            Some(libc::EAGAIN | libc::EBUSY | libc::ENOBUFS | libc::ENETDOWN) => Ok(()),
            _ => Err(RingError::Submit(format!("TX kick failed: {err}"))),
        }
    }
}

impl TxRing for AfXdpRing {
    type Stats = AfXdpStats;

    fn slot_size(&self) -> usize {
        self.frame_size as usize
    }

    fn free_slot_count(&self) -> usize {
        self.free_frames.len().min(self.tx.free_entries() as usize)
    }

    fn acquire(&mut self, count: usize, out: &mut Vec<TxDesc>) -> usize {
        let n = count.min(self.free_slot_count());
        let start = self.free_frames.len() - n;
        let taken = self.free_frames.drain(start..);
        out.extend(taken.map(|addr| TxDesc { addr, len: 0 }));
        n
    }

    fn buffer_for(&mut self, desc: &TxDesc) -> Result<&mut [u8], RingError> {
        let offset = self.frame_offset(desc.addr, desc.len)?;
        let len = self.frame_size as usize;
        Ok(self.umem.frame_mut(offset, len))
    }

    fn submit(&mut self, descs: &[TxDesc]) -> Result<usize, RingError> {
        if descs.is_empty() {
            return Ok(0);
        }
        let free = self.tx.free_entries() as usize;
        if descs.len() > free {
            return Err(RingError::Submit(format!(
                "TX ring has {free} free entries, {} submitted",
                descs.len()
            )));
        }
        for desc in descs {
            self.frame_offset(desc.addr, desc.len)?;
            if desc.len == 0 || desc.len > self.frame_size {
                return Err(RingError::InvalidDescriptor {
                    addr: desc.addr,
                    len: desc.len,
                });
            }
        }

        let mut index = self.tx.cached;
        for desc in descs {
            self.tx.write_tx(
                index,
                XdpDesc {
                    addr: desc.addr,
                    len: desc.len,
                    options: 0,
                },
            );
            index = index.wrapping_add(1);
        }
        self.tx.cached = index;
        self.tx.producer().store(index, Ordering::Release);

        let n = descs.len() as u32;
        self.outstanding += n;
        self.counters.record_submitted(u64::from(n));

        if !self.need_wakeup || self.tx.needs_wakeup() {
            self.kick()?;
        }
        Ok(descs.len())
    }

    fn reap(&mut self, max: usize) -> Result<usize, RingError> {
        let ready = self.comp.ready_entries() as usize;
        let n = ready.min(max);
        if n == 0 {
            // Copy mode only makes progress on a kick
            if self.outstanding > 0 && (!self.need_wakeup || self.tx.needs_wakeup()) {
                self.kick().map_err(|e| RingError::Reap(e.to_string()))?;
            }
            return Ok(0);
        }

        let mut index = self.comp.cached;
        for _ in 0..n {
            let addr = self.comp.read_comp(index);
            if addr % u64::from(self.frame_size) != 0 || addr as usize >= self.umem.size {
                return Err(RingError::Reap(format!("kernel completed unknown frame {addr:#x}")));
            }
            self.free_frames.push(addr);
            index = index.wrapping_add(1);
        }
        self.comp.cached = index;
        self.comp.consumer().store(index, Ordering::Release);

        self.outstanding = self.outstanding.saturating_sub(n as u32);
        self.counters.record_completed(n as u64);
        Ok(n)
    }

    fn stats_source(&self) -> AfXdpStats {
        AfXdpStats {
            socket: Arc::downgrade(&self.socket),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl Drop for AfXdpRing {
    fn drop(&mut self) {
        debug!(
            ifindex = self.ifindex,
            queue_id = self.queue_id,
            outstanding = self.outstanding,
            "Releasing AF_XDP ring"
        );
    }
}

/// Counter reader that stays valid on another thread while the ring runs.
///
/// Holds only a weak reference to the socket, so it never keeps the ring's
/// kernel resources alive; reads after release fail with [`RingError::Closed`].
#[derive(Debug, Clone)]
pub struct AfXdpStats {
    socket: Weak<OwnedFd>,
    counters: Arc<TxCounters>,
}

impl StatsSource for AfXdpStats {
    fn stats(&self) -> Result<RingStats, RingError> {
        let socket = self.socket.upgrade().ok_or(RingError::Closed)?;

        let mut raw = XdpStatistics::default();
        let mut optlen = mem::size_of::<XdpStatistics>() as libc::socklen_t;
        // SAFETY: raw is writable for optlen bytes and the kernel reports how
        // many it filled
        let ret = unsafe {
            libc::getsockopt(
                socket.as_raw_fd(),
                SOL_XDP,
                XDP_STATISTICS,
                (&mut raw as *mut XdpStatistics).cast(),
                &mut optlen,
            )
        };
        if ret < 0 {
            return Err(RingError::Stats(io::Error::last_os_error()));
        }

        let mut stats = self.counters.snapshot();
        // Older kernels return only the first three fields
        if optlen as usize >= 3 * mem::size_of::<u64>() {
            stats.tx_invalid_descs = raw.tx_invalid_descs;
        }
        if optlen as usize >= mem::size_of::<XdpStatistics>() {
            stats.tx_ring_empty_descs = raw.tx_ring_empty_descs;
        }
        Ok(stats)
    }
}

fn create_socket() -> Result<OwnedFd, AfXdpError> {
    // SAFETY: plain socket(2) call, the result is checked before use
    let fd = unsafe { libc::socket(libc::AF_XDP, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(AfXdpError::SocketCreation(io::Error::last_os_error()));
    }
    // SAFETY: fd is a freshly created descriptor we exclusively own
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn setsockopt<T>(
    socket: &OwnedFd,
    option: libc::c_int,
    name: &'static str,
    value: &T,
) -> Result<(), AfXdpError> {
    // SAFETY: value points to a live T and the length matches it
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            SOL_XDP,
            option,
            (value as *const T).cast(),
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(AfXdpError::SocketOption {
            option: name,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

fn register_umem(socket: &OwnedFd, umem: &Umem, frame_size: u32) -> Result<(), AfXdpError> {
    let reg = XdpUmemReg {
        addr: umem.addr(),
        len: umem.size as u64,
        chunk_size: frame_size,
        headroom: 0,
        flags: 0,
        tx_metadata_len: 0,
    };
    setsockopt(socket, XDP_UMEM_REG, "XDP_UMEM_REG", &reg)?;
    debug!(len = umem.size, chunk_size = frame_size, "UMEM registered");
    Ok(())
}

fn set_ring_size(
    socket: &OwnedFd,
    option: libc::c_int,
    name: &'static str,
    entries: u32,
) -> Result<(), AfXdpError> {
    setsockopt(socket, option, name, &entries)
}

/// Read TX and completion ring offsets, accepting the pre-5.4 layout.
fn mmap_offsets(socket: &OwnedFd) -> Result<(RingOffsets, RingOffsets), AfXdpError> {
    let mut off = XdpMmapOffsets::default();
    let mut optlen = mem::size_of::<XdpMmapOffsets>() as libc::socklen_t;
    // SAFETY: off is writable for optlen bytes
    let ret = unsafe {
        libc::getsockopt(
            socket.as_raw_fd(),
            SOL_XDP,
            XDP_MMAP_OFFSETS,
            (&mut off as *mut XdpMmapOffsets).cast(),
            &mut optlen,
        )
    };
    if ret < 0 {
        return Err(AfXdpError::SocketOption {
            option: "XDP_MMAP_OFFSETS",
            source: io::Error::last_os_error(),
        });
    }

    match optlen as usize {
        n if n == mem::size_of::<XdpMmapOffsets>() => {
            let with_flags = |r: XdpRingOffset| RingOffsets {
                producer: r.producer,
                consumer: r.consumer,
                desc: r.desc,
                flags: Some(r.flags),
            };
            Ok((with_flags(off.tx), with_flags(off.cr)))
        }
        n if n == mem::size_of::<XdpMmapOffsetsV1>() => {
            // SAFETY: the kernel filled the buffer with the smaller v1 layout,
            // which fits inside XdpMmapOffsets
            let v1: XdpMmapOffsetsV1 =
                unsafe { ptr::read((&off as *const XdpMmapOffsets).cast()) };
            let without_flags = |r: XdpRingOffsetV1| RingOffsets {
                producer: r.producer,
                consumer: r.consumer,
                desc: r.desc,
                flags: None,
            };
            Ok((without_flags(v1.tx), without_flags(v1.cr)))
        }
        n => Err(AfXdpError::SocketOption {
            option: "XDP_MMAP_OFFSETS",
            source: io::Error::new(io::ErrorKind::InvalidData, format!("unexpected optlen {n}")),
        }),
    }
}

fn bind_socket(
    socket: &OwnedFd,
    ifindex: u32,
    queue_id: u32,
    flags: u16,
) -> Result<(), AfXdpError> {
    let sxdp = SockaddrXdp {
        sxdp_family: libc::AF_XDP as u16,
        sxdp_flags: flags,
        sxdp_ifindex: ifindex,
        sxdp_queue_id: queue_id,
        sxdp_shared_umem_fd: 0,
    };
    // SAFETY: sxdp is a valid sockaddr_xdp and the length matches it
    let ret = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            (&sxdp as *const SockaddrXdp).cast(),
            mem::size_of::<SockaddrXdp>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(AfXdpError::SocketBind {
            ifindex,
            queue_id,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}
