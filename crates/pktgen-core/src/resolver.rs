//! Destination to link-layer address resolution.
//!
//! Resolution reads the kernel tables exactly once, in order: route, neighbor
//! entry of the next hop, outbound interface address, then an advisory source
//! port. Nothing is retried and no kernel state is changed, so a missing
//! neighbor entry is reported rather than repaired.

use std::io;
use std::net::{IpAddr, ToSocketAddrs};

use pktgen_transport::{AddressFamily, PortAllocator, Route, RouteTables};
use tracing::{debug, info};

use crate::addr::LinkAddresses;
use crate::error::ResolveError;

/// Outcome of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Addresses every frame carries
    pub addresses: LinkAddresses,
    /// Outbound interface index
    pub ifindex: u32,
    /// Outbound interface name
    pub interface: String,
    /// Gateway, or the destination itself when directly connected
    pub next_hop: IpAddr,
    /// Outbound interface MTU, when the kernel reports one
    pub mtu: Option<u32>,
}

/// Resolves destinations against a routing table snapshot.
pub struct Resolver<T, P> {
    tables: T,
    ports: P,
}

impl<T: RouteTables, P: PortAllocator> Resolver<T, P> {
    /// Create a resolver over the given tables and port allocator
    pub fn new(tables: T, ports: P) -> Self {
        Self { tables, ports }
    }

    /// Resolve the addressing needed to send UDP to `dest:dst_port`.
    ///
    /// # Errors
    ///
    /// - [`ResolveError::NoRoute`] when the routing table has nothing for `dest`
    /// - [`ResolveError::NeighborNotFound`] when the next hop has no hardware address
    /// - [`ResolveError::InterfaceLookup`] when the outbound link cannot be read
    /// - [`ResolveError::NoSourceAddress`] when the route has no preferred source
    /// - [`ResolveError::PortAllocation`] when no source port can be bound
    pub fn resolve(&self, dest: IpAddr, dst_port: u16) -> Result<Resolution, ResolveError> {
        let routes = self.tables.routes_to(dest)?;
        let route = select_route(&routes).ok_or(ResolveError::NoRoute(dest))?;
        debug!(
            %dest,
            oif = route.oif,
            gateway = ?route.gateway,
            candidates = routes.len(),
            "Route selected"
        );

        let next_hop = route.gateway.unwrap_or(dest);
        let neighbors = self.tables.neighbors_on(route.oif, AddressFamily::of(next_hop))?;
        let dst_mac = neighbors
            .iter()
            .filter(|n| n.ip == next_hop)
            .find_map(|n| n.mac)
            .ok_or(ResolveError::NeighborNotFound {
                next_hop,
                ifindex: route.oif,
            })?;
        debug!(%next_hop, %dst_mac, "Next hop resolved");

        let link = self
            .tables
            .link_by_index(route.oif)
            .map_err(|e| ResolveError::InterfaceLookup {
                ifindex: route.oif,
                reason: e.to_string(),
            })?;
        let src_mac = link.mac.ok_or_else(|| ResolveError::InterfaceLookup {
            ifindex: route.oif,
            reason: format!("interface {:?} has no hardware address", link.name),
        })?;

        let src_ip = route.prefsrc.ok_or(ResolveError::NoSourceAddress(dest))?;
        let src_port = self
            .ports
            .free_udp_port(src_ip)
            .map_err(|source| ResolveError::PortAllocation { ip: src_ip, source })?;

        let addresses = LinkAddresses {
            src_mac,
            dst_mac,
            src_ip,
            dst_ip: dest,
            src_port,
            dst_port,
        };
        info!(interface = %link.name, ifindex = route.oif, %addresses, "Destination resolved");

        Ok(Resolution {
            addresses,
            ifindex: route.oif,
            interface: link.name,
            next_hop,
            mtu: link.mtu,
        })
    }
}

/// Pick the authoritative route among the kernel's candidates.
///
/// The lowest metric wins, a missing metric counts as 0, and ties keep kernel
/// order, so a single route or equal metrics select the first one returned.
pub fn select_route(routes: &[Route]) -> Option<&Route> {
    routes
        .iter()
        .enumerate()
        .min_by_key(|(index, route)| (route.priority.unwrap_or(0), *index))
        .map(|(_, route)| route)
}

/// Turn a host argument (IP literal or name) into one address.
///
/// Names go through the system resolver. IPv4 results are preferred, then
/// the first IPv6 result.
pub fn lookup_host(host: &str) -> Result<IpAddr, ResolveError> {
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        return Ok(ip);
    }

    let lookup_err = |source| ResolveError::HostLookup {
        host: host.to_string(),
        source,
    };
    let candidates: Vec<IpAddr> = (host, 0)
        .to_socket_addrs()
        .map_err(lookup_err)?
        .map(|addr| addr.ip())
        .collect();

    let chosen = candidates
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| {
            lookup_err(io::Error::new(io::ErrorKind::NotFound, "no addresses returned"))
        })?;
    debug!(host, %chosen, candidates = candidates.len(), "Host resolved");
    Ok(chosen)
}
