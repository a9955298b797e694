//! Ethernet/IP/UDP frame template.
//!
//! The frame is serialized once per run. Every transmitted frame is a
//! byte-for-byte copy, so lengths and checksums are computed here and never
//! touched again.

use std::net::IpAddr;

use etherparse::{IpHeaders, Ipv4Header, PacketBuilder};
use tracing::debug;

use crate::DEFAULT_HOP_LIMIT;
use crate::addr::{IpVersion, LinkAddresses};
use crate::error::FrameError;

/// Ethernet II header length
pub const ETHERNET_HEADER_LEN: usize = 14;
/// IPv4 header length without options
pub const IPV4_HEADER_LEN: usize = 20;
/// IPv6 fixed header length
pub const IPV6_HEADER_LEN: usize = 40;
/// UDP header length
pub const UDP_HEADER_LEN: usize = 8;

/// Largest UDP payload whose lengths still fit the 16-bit header fields
pub fn max_payload_len(version: IpVersion) -> usize {
    match version {
        IpVersion::V4 => usize::from(u16::MAX) - IPV4_HEADER_LEN - UDP_HEADER_LEN,
        IpVersion::V6 => usize::from(u16::MAX) - UDP_HEADER_LEN,
    }
}

/// Immutable, checksum-correct serialized frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameTemplate {
    bytes: Vec<u8>,
    version: IpVersion,
}

impl FrameTemplate {
    /// Serialize Ethernet, IP and UDP headers followed by `payload`.
    ///
    /// # Errors
    ///
    /// [`FrameError::AddressFamilyMismatch`] when either address is not of
    /// `version`, and [`FrameError::PayloadTooLarge`] when the payload cannot be
    /// described by the length fields.
    pub fn build(
        addrs: &LinkAddresses,
        version: IpVersion,
        payload: &[u8],
    ) -> Result<Self, FrameError> {
        let max = max_payload_len(version);
        if payload.len() > max {
            return Err(FrameError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }

        let eth = PacketBuilder::ethernet2(addrs.src_mac.octets(), addrs.dst_mac.octets());
        let builder = match (version, addrs.src_ip, addrs.dst_ip) {
            (IpVersion::V4, IpAddr::V4(src), IpAddr::V4(dst)) => {
                // Flags and fragment offset all zero
                let header = Ipv4Header {
                    source: src.octets(),
                    destination: dst.octets(),
                    time_to_live: DEFAULT_HOP_LIMIT,
                    dont_fragment: false,
                    ..Default::default()
                };
                eth.ip(IpHeaders::Ipv4(header, Default::default()))
                    .udp(addrs.src_port, addrs.dst_port)
            }
            (IpVersion::V6, IpAddr::V6(src), IpAddr::V6(dst)) => eth
                .ipv6(src.octets(), dst.octets(), DEFAULT_HOP_LIMIT)
                .udp(addrs.src_port, addrs.dst_port),
            _ => {
                return Err(FrameError::AddressFamilyMismatch {
                    version,
                    src: addrs.src_ip,
                    dst: addrs.dst_ip,
                });
            }
        };

        let mut bytes = Vec::with_capacity(builder.size(payload.len()));
        builder
            .write(&mut bytes, payload)
            .map_err(|e| FrameError::Serialize(e.to_string()))?;

        debug!(len = bytes.len(), %version, "Frame template built");
        Ok(Self { bytes, version })
    }

    /// Serialized frame
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Frame length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Never true for a built frame
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Network layer of the frame
    pub fn ip_version(&self) -> IpVersion {
        self.version
    }

    /// Offset of the UDP header
    pub fn udp_offset(&self) -> usize {
        ETHERNET_HEADER_LEN
            + match self.version {
                IpVersion::V4 => IPV4_HEADER_LEN,
                IpVersion::V6 => IPV6_HEADER_LEN,
            }
    }

    /// Offset of the UDP payload
    pub fn payload_offset(&self) -> usize {
        self.udp_offset() + UDP_HEADER_LEN
    }
}
