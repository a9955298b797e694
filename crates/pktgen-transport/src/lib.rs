//! # pktgen Transport
//!
//! Kernel-facing collaborators for the pktgen packet generator.
//!
//! This crate provides:
//! - An AF_XDP transmit-only ring over a pinned UMEM region
//! - The `TxRing` capability trait the transmit engine drives
//! - Route, neighbor and link queries over a raw rtnetlink socket
//! - Advisory ephemeral UDP port allocation

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod port;
pub mod ring;
pub mod tables;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// AF_XDP and rtnetlink are Linux-specific
#[cfg(target_os = "linux")]
pub mod af_xdp;
#[cfg(target_os = "linux")]
pub mod netlink;

pub use port::{EphemeralPorts, PortAllocator};
pub use ring::{MemoryRing, RingError, RingStats, StatsSource, TxCounters, TxDesc, TxRing};
pub use tables::{AddressFamily, LinkInfo, MacAddr, Neighbor, Route, RouteTables, TablesError};

#[cfg(target_os = "linux")]
pub use af_xdp::{AfXdpError, AfXdpRing, AfXdpStats, BindMode, RingConfig};
#[cfg(target_os = "linux")]
pub use netlink::NetlinkTables;
