//! Resolved addressing for the generated flow.

use std::fmt;
use std::net::IpAddr;

use pktgen_transport::MacAddr;

/// Network layer of a run. Chosen by the destination address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

impl IpVersion {
    /// Version of an address
    pub fn of(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => f.write_str("IPv4"),
            Self::V6 => f.write_str("IPv6"),
        }
    }
}

/// Link, network and transport addresses of every generated frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkAddresses {
    /// Outbound interface's own hardware address
    pub src_mac: MacAddr,
    /// Next hop's hardware address
    pub dst_mac: MacAddr,
    /// Route's preferred source address
    pub src_ip: IpAddr,
    /// Destination address
    pub dst_ip: IpAddr,
    /// Allocated source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
}

impl LinkAddresses {
    /// IP version of the destination
    pub fn ip_version(&self) -> IpVersion {
        IpVersion::of(self.dst_ip)
    }
}

impl fmt::Display for LinkAddresses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let src = std::net::SocketAddr::new(self.src_ip, self.src_port);
        let dst = std::net::SocketAddr::new(self.dst_ip, self.dst_port);
        write!(f, "{src} ({}) -> {dst} ({})", self.src_mac, self.dst_mac)
    }
}
