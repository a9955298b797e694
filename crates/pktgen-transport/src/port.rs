//! Advisory UDP source port allocation.
//!
//! A port is obtained by binding a throwaway UDP socket to `ip:0` and reading
//! back the kernel's choice. The socket is closed immediately, so nothing
//! stops another process from taking the same port later.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};

/// Source of UDP source ports.
pub trait PortAllocator {
    /// Pick a currently unused UDP port on `ip`.
    fn free_udp_port(&self, ip: IpAddr) -> io::Result<u16>;
}

impl<T: PortAllocator + ?Sized> PortAllocator for &T {
    fn free_udp_port(&self, ip: IpAddr) -> io::Result<u16> {
        (**self).free_udp_port(ip)
    }
}

/// Kernel-assigned ephemeral ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct EphemeralPorts;

impl PortAllocator for EphemeralPorts {
    fn free_udp_port(&self, ip: IpAddr) -> io::Result<u16> {
        let domain = if ip.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.bind(&SocketAddr::new(ip, 0).into())?;

        let local = socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::other("bound socket has no inet address"))?;
        Ok(local.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_ephemeral_port_v4() {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let port = EphemeralPorts.free_udp_port(ip).unwrap();
        assert_ne!(port, 0);
    }

    #[test]
    fn test_ephemeral_port_v6() {
        let Ok(port) = EphemeralPorts.free_udp_port(IpAddr::V6(Ipv6Addr::LOCALHOST)) else {
            eprintln!("Skipping IPv6 port test (no IPv6 loopback)");
            return;
        };
        assert_ne!(port, 0);
    }

    #[test]
    fn test_port_is_released() {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let port = EphemeralPorts.free_udp_port(ip).unwrap();

        // The allocating socket is closed, so the port can be bound again
        let socket = std::net::UdpSocket::bind(SocketAddr::new(ip, port));
        assert!(socket.is_ok());
    }

    #[test]
    fn test_unassigned_address_fails() {
        // TEST-NET-3 is never configured on a test host
        let ip: IpAddr = "203.0.113.250".parse().unwrap();
        let result = EphemeralPorts.free_udp_port(ip);
        assert!(result.is_err());
    }
}
