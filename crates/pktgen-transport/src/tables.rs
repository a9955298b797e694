//! Kernel routing, neighbor and link table types.
//!
//! The resolver only ever sees these tables through [`RouteTables`], so it can
//! be exercised against a fixed snapshot without touching the kernel.

use std::fmt;
use std::io;
use std::net::IpAddr;

use thiserror::Error;

/// Errors raised while reading kernel tables.
#[derive(Debug, Error)]
pub enum TablesError {
    /// Socket-level failure talking to the kernel
    #[error("netlink I/O error: {0}")]
    Io(#[from] io::Error),

    /// The kernel answered a request with an error code
    #[error("kernel rejected {request}: {source}")]
    Kernel {
        /// Request that failed
        request: &'static str,
        /// Errno reported by the kernel
        #[source]
        source: io::Error,
    },

    /// A reply could not be decoded
    #[error("malformed netlink message: {0}")]
    Malformed(String),
}

/// Six-byte Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// Create a MAC address from raw octets
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Raw octets
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Build from a link-layer attribute, which must be exactly 6 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 6]>::try_from(bytes).ok().map(Self)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Address family selector for neighbor queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// IPv4 (ARP table)
    Inet,
    /// IPv6 (NDP table)
    Inet6,
}

impl AddressFamily {
    /// Family of an IP address
    pub fn of(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::Inet,
            IpAddr::V6(_) => Self::Inet6,
        }
    }

    /// Kernel `AF_*` constant
    pub fn as_raw(self) -> u8 {
        match self {
            Self::Inet => 2,
            Self::Inet6 => 10,
        }
    }

    /// Map a kernel `AF_*` constant back to a family
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            2 => Some(Self::Inet),
            10 => Some(Self::Inet6),
            _ => None,
        }
    }
}

/// One routing table entry matching a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Outbound interface index
    pub oif: u32,
    /// Next-hop gateway, absent for directly connected destinations
    pub gateway: Option<IpAddr>,
    /// Preferred source address
    pub prefsrc: Option<IpAddr>,
    /// Route metric
    pub priority: Option<u32>,
}

/// Neighbor table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    /// Protocol address
    pub ip: IpAddr,
    /// Hardware address, absent while resolution is incomplete or failed
    pub mac: Option<MacAddr>,
}

/// Network interface attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    /// Interface index
    pub index: u32,
    /// Interface name
    pub name: String,
    /// Interface hardware address
    pub mac: Option<MacAddr>,
    /// Interface MTU
    pub mtu: Option<u32>,
}

/// Read-only view of the kernel's routing, neighbor and link tables.
pub trait RouteTables {
    /// Routes the kernel would use to reach `dest`, in kernel order.
    fn routes_to(&self, dest: IpAddr) -> Result<Vec<Route>, TablesError>;

    /// Neighbor entries of one family on one interface.
    fn neighbors_on(
        &self,
        ifindex: u32,
        family: AddressFamily,
    ) -> Result<Vec<Neighbor>, TablesError>;

    /// Attributes of the interface with the given index.
    fn link_by_index(&self, ifindex: u32) -> Result<LinkInfo, TablesError>;
}

impl<T: RouteTables + ?Sized> RouteTables for &T {
    fn routes_to(&self, dest: IpAddr) -> Result<Vec<Route>, TablesError> {
        (**self).routes_to(dest)
    }

    fn neighbors_on(
        &self,
        ifindex: u32,
        family: AddressFamily,
    ) -> Result<Vec<Neighbor>, TablesError> {
        (**self).neighbors_on(ifindex, family)
    }

    fn link_by_index(&self, ifindex: u32) -> Result<LinkInfo, TablesError> {
        (**self).link_by_index(ifindex)
    }
}
