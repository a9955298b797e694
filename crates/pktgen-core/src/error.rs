//! Error types for pktgen core.
//!
//! One enum per stage. The binary wraps them in `anyhow` with context.

use std::io;
use std::net::IpAddr;

use pktgen_transport::{RingError, TablesError};
use thiserror::Error;

use crate::addr::IpVersion;

/// Resolution errors
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Host name could not be turned into an address
    #[error("failed to look up host {host:?}: {source}")]
    HostLookup {
        /// Name as given
        host: String,
        /// Resolver failure
        #[source]
        source: io::Error,
    },

    /// The routing table has no route to the destination
    #[error("no route to {0}")]
    NoRoute(IpAddr),

    /// The next hop has no usable neighbor entry
    #[error("no neighbor entry for next hop {next_hop} on interface {ifindex}")]
    NeighborNotFound {
        /// Gateway, or the destination when directly connected
        next_hop: IpAddr,
        /// Outbound interface
        ifindex: u32,
    },

    /// Outbound interface attributes unavailable
    #[error("interface {ifindex} lookup failed: {reason}")]
    InterfaceLookup {
        /// Outbound interface
        ifindex: u32,
        /// What was missing
        reason: String,
    },

    /// Route carries no preferred source address
    #[error("route to {0} has no source address")]
    NoSourceAddress(IpAddr),

    /// Ephemeral source port could not be obtained
    #[error("failed to allocate UDP source port on {ip}: {source}")]
    PortAllocation {
        /// Source address the port was requested on
        ip: IpAddr,
        /// Bind failure
        #[source]
        source: io::Error,
    },

    /// Kernel tables could not be read
    #[error("kernel table query failed: {0}")]
    Tables(#[from] TablesError),
}

/// Payload generation errors
#[derive(Debug, Error)]
pub enum PayloadError {
    /// Body too short for the marker and timestamp
    #[error("payload size {size} below minimum {min}")]
    TooSmall {
        /// Requested body size
        size: usize,
        /// Minimum body size
        min: usize,
    },

    /// OS random source failed
    #[error("OS random source failed: {0}")]
    Entropy(getrandom::Error),
}

/// Frame serialization errors
#[derive(Debug, Error)]
pub enum FrameError {
    /// Addresses do not belong to the requested IP version
    #[error("addresses {src} -> {dst} do not match {version}")]
    AddressFamilyMismatch {
        /// Requested network layer
        version: IpVersion,
        /// Source address
        src: IpAddr,
        /// Destination address
        dst: IpAddr,
    },

    /// Payload too large for the length fields
    #[error("payload of {len} bytes exceeds maximum {max}")]
    PayloadTooLarge {
        /// Payload length
        len: usize,
        /// Largest payload the headers can describe
        max: usize,
    },

    /// Header serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
}

/// Transmit engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    /// Template does not fit in a ring slot
    #[error("frame of {frame} bytes does not fit in {slot}-byte ring slots")]
    FrameTooLarge {
        /// Template length
        frame: usize,
        /// Slot capacity
        slot: usize,
    },

    /// Ring submit or reap failed
    #[error("ring error: {0}")]
    Ring(#[from] RingError),
}

/// Reporter errors. These never stop transmission.
#[derive(Debug, Error)]
pub enum ReporterError {
    /// Counters could not be read
    #[error("failed to sample ring counters: {0}")]
    Stats(#[from] RingError),
}
