//! Route, neighbor and link queries over a raw `NETLINK_ROUTE` socket.
//!
//! Only the three read-only requests the resolver needs are implemented:
//! `RTM_GETROUTE` (a single route lookup, like `ip route get`), an
//! `RTM_GETNEIGH` dump filtered in userspace, and `RTM_GETLINK` by index.
//! Messages use native byte order with 4-byte alignment.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, trace};

use crate::tables::{AddressFamily, LinkInfo, MacAddr, Neighbor, Route, RouteTables, TablesError};

const NLMSG_HDRLEN: usize = 16;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

const NLM_F_REQUEST: u16 = 0x1;
const NLM_F_MULTI: u16 = 0x2;
const NLM_F_DUMP: u16 = 0x300;

const RTM_GETLINK: u16 = 18;
const RTM_GETROUTE: u16 = 26;
const RTM_GETNEIGH: u16 = 30;

const RTA_DST: u16 = 1;
const RTA_OIF: u16 = 4;
const RTA_GATEWAY: u16 = 5;
const RTA_PRIORITY: u16 = 6;
const RTA_PREFSRC: u16 = 7;

const NDA_DST: u16 = 1;
const NDA_LLADDR: u16 = 2;

const IFLA_ADDRESS: u16 = 1;
const IFLA_IFNAME: u16 = 3;
const IFLA_MTU: u16 = 4;

const NUD_INCOMPLETE: u16 = 0x01;
const NUD_FAILED: u16 = 0x20;

// NLA_F_NESTED and NLA_F_NET_BYTEORDER live in the top bits of the type
const NLA_TYPE_MASK: u16 = 0x3fff;

const RTMSG_LEN: usize = 12;
const NDMSG_LEN: usize = 12;
const IFINFOMSG_LEN: usize = 16;

const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Round up to the 4-byte netlink alignment
const fn align(len: usize) -> usize {
    (len + 3) & !3
}

/// Kernel tables read through rtnetlink.
pub struct NetlinkTables {
    fd: OwnedFd,
    seq: AtomicU32,
}

impl NetlinkTables {
    /// Open and bind a `NETLINK_ROUTE` socket.
    pub fn open() -> Result<Self, TablesError> {
        // SAFETY: plain socket(2) call, the result is checked before use
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_ROUTE,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: raw is a freshly created descriptor we exclusively own
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: sockaddr_nl is plain old data, all-zero is a valid value
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        // SAFETY: addr is a valid sockaddr_nl and the length matches it
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&addr as *const libc::sockaddr_nl).cast(),
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }

        debug!("rtnetlink socket opened");
        Ok(Self {
            fd,
            seq: AtomicU32::new(1),
        })
    }

    /// Send one request and collect the bodies of every reply message.
    fn transact(
        &self,
        request: &'static str,
        msg_type: u16,
        flags: u16,
        body: &[u8],
    ) -> Result<Vec<Vec<u8>>, TablesError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let packet = encode_request(msg_type, flags | NLM_F_REQUEST, seq, body);
        self.send(&packet)?;

        let dump = flags & NLM_F_DUMP == NLM_F_DUMP;
        let mut replies = Vec::new();
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            let len = self.recv(&mut buf)?;
            for msg in split_messages(&buf[..len])? {
                if msg.seq != seq {
                    trace!(seq = msg.seq, "ignoring stale netlink message");
                    continue;
                }
                match msg.kind {
                    NLMSG_DONE => return Ok(replies),
                    NLMSG_ERROR => {
                        let code = decode_error(msg.body)?;
                        if code == 0 {
                            return Ok(replies);
                        }
                        return Err(TablesError::Kernel {
                            request,
                            source: io::Error::from_raw_os_error(-code),
                        });
                    }
                    _ => {
                        replies.push(msg.body.to_vec());
                        if !dump && msg.flags & NLM_F_MULTI == 0 {
                            return Ok(replies);
                        }
                    }
                }
            }
        }
    }

    fn send(&self, packet: &[u8]) -> io::Result<()> {
        loop {
            // SAFETY: packet is a live buffer of packet.len() bytes
            let ret = unsafe {
                libc::send(self.fd.as_raw_fd(), packet.as_ptr().cast(), packet.len(), 0)
            };
            if ret >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // SAFETY: buf is a live, writable buffer of buf.len() bytes
            let ret = unsafe {
                libc::recv(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0)
            };
            if ret >= 0 {
                return Ok(ret as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl RouteTables for NetlinkTables {
    fn routes_to(&self, dest: IpAddr) -> Result<Vec<Route>, TablesError> {
        let family = AddressFamily::of(dest);
        let addr = ip_octets(dest);

        let mut body = vec![0u8; RTMSG_LEN];
        body[0] = family.as_raw();
        body[1] = (addr.len() * 8) as u8;
        push_attr(&mut body, RTA_DST, &addr);

        let replies = match self.transact("RTM_GETROUTE", RTM_GETROUTE, 0, &body) {
            Ok(replies) => replies,
            // An unreachable destination is an empty answer, not a failure
            Err(TablesError::Kernel { source, .. })
                if matches!(
                    source.raw_os_error(),
                    Some(libc::ENETUNREACH | libc::EHOSTUNREACH)
                ) =>
            {
                debug!(%dest, "kernel reports destination unreachable");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut routes = Vec::with_capacity(replies.len());
        for reply in &replies {
            if let Some(route) = parse_route(reply)? {
                routes.push(route);
            }
        }
        debug!(%dest, count = routes.len(), "route lookup complete");
        Ok(routes)
    }

    fn neighbors_on(
        &self,
        ifindex: u32,
        family: AddressFamily,
    ) -> Result<Vec<Neighbor>, TablesError> {
        let mut body = vec![0u8; NDMSG_LEN];
        body[0] = family.as_raw();

        let replies = self.transact("RTM_GETNEIGH", RTM_GETNEIGH, NLM_F_DUMP, &body)?;
        let mut neighbors = Vec::new();
        for reply in &replies {
            let (index, entry_family, neighbor) = parse_neighbor(reply)?;
            if index == ifindex && entry_family == Some(family) {
                if let Some(neighbor) = neighbor {
                    neighbors.push(neighbor);
                }
            }
        }
        debug!(ifindex, ?family, count = neighbors.len(), "neighbor dump complete");
        Ok(neighbors)
    }

    fn link_by_index(&self, ifindex: u32) -> Result<LinkInfo, TablesError> {
        let mut body = vec![0u8; IFINFOMSG_LEN];
        body[4..8].copy_from_slice(&(ifindex as i32).to_ne_bytes());

        let replies = self.transact("RTM_GETLINK", RTM_GETLINK, 0, &body)?;
        let reply = replies.first().ok_or_else(|| {
            TablesError::Malformed(format!("no RTM_NEWLINK reply for interface {ifindex}"))
        })?;
        parse_link(reply)
    }
}

/// One decoded netlink message, borrowing its body from the receive buffer.
#[derive(Debug)]
struct Message<'a> {
    kind: u16,
    flags: u16,
    seq: u32,
    body: &'a [u8],
}

fn encode_request(msg_type: u16, flags: u16, seq: u32, body: &[u8]) -> Vec<u8> {
    let len = NLMSG_HDRLEN + body.len();
    let mut packet = Vec::with_capacity(align(len));
    packet.extend_from_slice(&(len as u32).to_ne_bytes());
    packet.extend_from_slice(&msg_type.to_ne_bytes());
    packet.extend_from_slice(&flags.to_ne_bytes());
    packet.extend_from_slice(&seq.to_ne_bytes());
    packet.extend_from_slice(&0u32.to_ne_bytes());
    packet.extend_from_slice(body);
    packet.resize(align(len), 0);
    packet
}

fn push_attr(buf: &mut Vec<u8>, kind: u16, data: &[u8]) {
    let len = 4 + data.len();
    buf.extend_from_slice(&(len as u16).to_ne_bytes());
    buf.extend_from_slice(&kind.to_ne_bytes());
    buf.extend_from_slice(data);
    buf.resize(buf.len() + align(len) - len, 0);
}

fn split_messages(mut buf: &[u8]) -> Result<Vec<Message<'_>>, TablesError> {
    let mut messages = Vec::new();
    while buf.len() >= NLMSG_HDRLEN {
        let len = read_u32(buf, 0) as usize;
        if len < NLMSG_HDRLEN || len > buf.len() {
            return Err(TablesError::Malformed(format!(
                "message length {len} outside buffer of {}",
                buf.len()
            )));
        }
        messages.push(Message {
            kind: read_u16(buf, 4),
            flags: read_u16(buf, 6),
            seq: read_u32(buf, 8),
            body: &buf[NLMSG_HDRLEN..len],
        });
        buf = &buf[align(len).min(buf.len())..];
    }
    Ok(messages)
}

fn decode_error(body: &[u8]) -> Result<i32, TablesError> {
    let bytes = body
        .get(..4)
        .ok_or_else(|| TablesError::Malformed("truncated NLMSG_ERROR".into()))?;
    Ok(i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Iterator over `(type, payload)` pairs of a netlink attribute block.
struct Attrs<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for Attrs<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < 4 {
            return None;
        }
        let len = read_u16(self.buf, 0) as usize;
        if len < 4 || len > self.buf.len() {
            self.buf = &[];
            return None;
        }
        let kind = read_u16(self.buf, 2) & NLA_TYPE_MASK;
        let data = &self.buf[4..len];
        self.buf = &self.buf[align(len).min(self.buf.len())..];
        Some((kind, data))
    }
}

fn attrs(buf: &[u8], header_len: usize) -> Result<Attrs<'_>, TablesError> {
    let rest = buf.get(header_len..).ok_or_else(|| {
        TablesError::Malformed(format!("body shorter than {header_len}-byte header"))
    })?;
    Ok(Attrs { buf: rest })
}

fn parse_route(body: &[u8]) -> Result<Option<Route>, TablesError> {
    let mut oif = None;
    let mut route = Route {
        oif: 0,
        gateway: None,
        prefsrc: None,
        priority: None,
    };
    for (kind, data) in attrs(body, RTMSG_LEN)? {
        match kind {
            RTA_OIF => oif = data.get(..4).map(|_| read_u32(data, 0)),
            RTA_GATEWAY => route.gateway = ip_from_bytes(data),
            RTA_PREFSRC => route.prefsrc = ip_from_bytes(data),
            RTA_PRIORITY => route.priority = data.get(..4).map(|_| read_u32(data, 0)),
            _ => {}
        }
    }
    // Routes without an outbound interface (blackhole, prohibit) are useless here
    Ok(oif.map(|oif| Route { oif, ..route }))
}

type NeighborEntry = (u32, Option<AddressFamily>, Option<Neighbor>);

fn parse_neighbor(body: &[u8]) -> Result<NeighborEntry, TablesError> {
    if body.len() < NDMSG_LEN {
        return Err(TablesError::Malformed("truncated ndmsg".into()));
    }
    let family = AddressFamily::from_raw(body[0]);
    let ifindex = read_u32(body, 4);
    let state = read_u16(body, 8);

    let mut ip = None;
    let mut mac = None;
    for (kind, data) in attrs(body, NDMSG_LEN)? {
        match kind {
            NDA_DST => ip = ip_from_bytes(data),
            NDA_LLADDR => mac = MacAddr::from_slice(data),
            _ => {}
        }
    }
    if state & (NUD_INCOMPLETE | NUD_FAILED) != 0 {
        mac = None;
    }
    Ok((ifindex, family, ip.map(|ip| Neighbor { ip, mac })))
}

fn parse_link(body: &[u8]) -> Result<LinkInfo, TablesError> {
    if body.len() < IFINFOMSG_LEN {
        return Err(TablesError::Malformed("truncated ifinfomsg".into()));
    }
    let mut link = LinkInfo {
        index: read_u32(body, 4),
        name: String::new(),
        mac: None,
        mtu: None,
    };
    for (kind, data) in attrs(body, IFINFOMSG_LEN)? {
        match kind {
            IFLA_ADDRESS => link.mac = MacAddr::from_slice(data),
            IFLA_IFNAME => {
                let name = data.split(|&b| b == 0).next().unwrap_or_default();
                link.name = String::from_utf8_lossy(name).into_owned();
            }
            IFLA_MTU => link.mtu = data.get(..4).map(|_| read_u32(data, 0)),
            _ => {}
        }
    }
    Ok(link)
}

fn ip_octets(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn ip_from_bytes(data: &[u8]) -> Option<IpAddr> {
    if let Ok(v4) = <[u8; 4]>::try_from(data) {
        return Some(IpAddr::V4(Ipv4Addr::from(v4)));
    }
    <[u8; 16]>::try_from(data)
        .ok()
        .map(|v6| IpAddr::V6(Ipv6Addr::from(v6)))
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_ne_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}
