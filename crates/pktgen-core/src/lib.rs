//! # pktgen Core
//!
//! Core of the pktgen AF_XDP UDP packet generator.
//!
//! This crate provides:
//! - Destination to link-layer address resolution
//! - Payload construction (timestamp marker or random bytes)
//! - Single-shot Ethernet/IPv4-or-IPv6/UDP frame building
//! - The transmit engine that keeps a ring full until cancelled
//! - The once-per-second throughput reporter
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌────────────────┐
//! │   Resolver   │──▶│ Frame builder │──▶│ Transmit engine│◀── Shutdown
//! └──────────────┘   └───────────────┘   └───────┬────────┘
//!                                                │ completion counter
//!                                        ┌───────▼────────┐
//!                                        │    Reporter    │◀── Shutdown
//!                                        └────────────────┘
//! ```
//!
//! Kernel collaborators (routing tables, port allocation, the TX ring) are
//! reached only through the traits in `pktgen-transport`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod addr;
pub mod engine;
pub mod error;
pub mod frame;
pub mod payload;
pub mod reporter;
pub mod resolver;
pub mod shutdown;

pub use addr::{IpVersion, LinkAddresses};
pub use engine::{EngineReport, EngineState, StateHandle, TransmitEngine};
pub use error::{EngineError, FrameError, PayloadError, ReporterError, ResolveError};
pub use frame::FrameTemplate;
pub use payload::{Payload, PayloadMode};
pub use reporter::{Throughput, ThroughputReporter, ThroughputSample};
pub use resolver::{Resolution, Resolver};
pub use shutdown::Shutdown;

/// Default UDP payload body length, before the magic signature
pub const DEFAULT_PAYLOAD_SIZE: usize = 1492;

/// IPv4 TTL / IPv6 hop limit of generated frames
pub const DEFAULT_HOP_LIMIT: u8 = 64;
