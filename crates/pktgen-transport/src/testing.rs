//! In-memory kernel collaborators for tests.
//!
//! Enabled by the `test-util` feature. Downstream crates turn it on from
//! their dev-dependencies so every test suite resolves against the same
//! fixture.

use std::io;
use std::net::IpAddr;
use std::sync::Mutex;

use crate::port::PortAllocator;
use crate::tables::{AddressFamily, LinkInfo, MacAddr, Neighbor, Route, RouteTables, TablesError};

/// Hardware address of the fake outbound interface
pub const LOCAL_MAC: MacAddr = MacAddr::new([0x02, 0x00, 0x5e, 0x10, 0x00, 0x01]);

/// Hardware address of the fake gateway
pub const GATEWAY_MAC: MacAddr = MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

/// Routing, neighbor and link tables held in memory.
///
/// Every destination gets the same route list. Neighbor queries are
/// recorded so tests can check which table was consulted.
#[derive(Debug, Default)]
pub struct StaticTables {
    /// Routes returned for every destination
    pub routes: Vec<Route>,
    /// Neighbor entries keyed by interface index
    pub neighbors: Vec<(u32, Neighbor)>,
    /// Known interfaces
    pub links: Vec<LinkInfo>,
    queries: Mutex<Vec<(u32, AddressFamily)>>,
}

impl StaticTables {
    /// One interface named `eth0`, one route via `gateway`, and the
    /// gateway's neighbor entry.
    pub fn with_gateway(ifindex: u32, src: IpAddr, gateway: IpAddr) -> Self {
        Self {
            routes: vec![Route {
                oif: ifindex,
                gateway: Some(gateway),
                prefsrc: Some(src),
                priority: Some(100),
            }],
            neighbors: vec![(
                ifindex,
                Neighbor {
                    ip: gateway,
                    mac: Some(GATEWAY_MAC),
                },
            )],
            links: vec![LinkInfo {
                index: ifindex,
                name: "eth0".to_string(),
                mac: Some(LOCAL_MAC),
                mtu: Some(1500),
            }],
            queries: Mutex::default(),
        }
    }

    /// `(ifindex, family)` of every neighbor query so far
    pub fn neighbor_queries(&self) -> Vec<(u32, AddressFamily)> {
        self.queries.lock().map(|q| q.clone()).unwrap_or_default()
    }
}

impl RouteTables for StaticTables {
    fn routes_to(&self, _dest: IpAddr) -> Result<Vec<Route>, TablesError> {
        Ok(self.routes.clone())
    }

    fn neighbors_on(
        &self,
        ifindex: u32,
        family: AddressFamily,
    ) -> Result<Vec<Neighbor>, TablesError> {
        if let Ok(mut queries) = self.queries.lock() {
            queries.push((ifindex, family));
        }
        Ok(self
            .neighbors
            .iter()
            .filter(|(index, n)| *index == ifindex && AddressFamily::of(n.ip) == family)
            .map(|(_, n)| n.clone())
            .collect())
    }

    fn link_by_index(&self, ifindex: u32) -> Result<LinkInfo, TablesError> {
        self.links
            .iter()
            .find(|l| l.index == ifindex)
            .cloned()
            .ok_or_else(|| TablesError::Kernel {
                request: "RTM_GETLINK",
                source: io::Error::from(io::ErrorKind::NotFound),
            })
    }
}

/// Port allocator that always returns the same port.
#[derive(Debug, Clone, Copy)]
pub struct FixedPort(pub u16);

impl PortAllocator for FixedPort {
    fn free_udp_port(&self, _ip: IpAddr) -> io::Result<u16> {
        Ok(self.0)
    }
}

/// Port allocator that always fails.
#[derive(Debug, Clone, Copy)]
pub struct NoPorts;

impl PortAllocator for NoPorts {
    fn free_udp_port(&self, _ip: IpAddr) -> io::Result<u16> {
        Err(io::Error::from(io::ErrorKind::AddrNotAvailable))
    }
}
