//! Shared helpers for pktgen integration and property tests
//!
//! Re-exports the in-memory kernel tables from `pktgen-transport` and adds
//! an independent checksum verifier for serialized frames.

pub use pktgen_transport::testing::{FixedPort, GATEWAY_MAC, LOCAL_MAC, StaticTables};

fn fold(chunks: &[&[u8]]) -> u16 {
    let mut sum = 0u64;
    for chunk in chunks {
        for pair in chunk.chunks(2) {
            let hi = u64::from(pair[0]) << 8;
            let lo = pair.get(1).map_or(0, |b| u64::from(*b));
            sum += hi | lo;
        }
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// Check the IP header checksum (IPv4 only) and UDP checksum of a frame.
///
/// Returns `false` for frames that are neither IPv4 nor IPv6.
pub fn checksums_valid(frame: &[u8]) -> bool {
    if frame.len() < 14 {
        return false;
    }
    match u16::from_be_bytes([frame[12], frame[13]]) {
        0x0800 => {
            let ip = &frame[14..34];
            let udp = &frame[34..];
            let len = (udp.len() as u16).to_be_bytes();
            fold(&[ip]) == 0xffff && fold(&[&ip[12..20], &[0, 17], &len, udp]) == 0xffff
        }
        0x86dd => {
            let ip = &frame[14..54];
            let udp = &frame[54..];
            let len = (udp.len() as u32).to_be_bytes();
            fold(&[&ip[8..40], &len, &[0, 0, 0, 17], udp]) == 0xffff
        }
        _ => false,
    }
}

/// Declared UDP length field of a frame
pub fn udp_length(frame: &[u8]) -> usize {
    let offset = match u16::from_be_bytes([frame[12], frame[13]]) {
        0x86dd => 54,
        _ => 34,
    };
    usize::from(u16::from_be_bytes([frame[offset + 4], frame[offset + 5]]))
}
