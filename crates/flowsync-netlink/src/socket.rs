//! Netlink socket handling for kernel topology events.
//!
//! Subscribes to the rtnetlink multicast groups for links, addresses,
//! neighbors and routes and decodes each message into a normalized
//! [`NetUpdate`]. Table dumps use the same socket: one dump kind at a
//! time (the kernel serializes dumps per socket), terminated by the
//! NLMSG_DONE marker surfaced through [`Batch::done`].

use crate::update::NetUpdate;

/// Which kernel table a dump request walks.
///
/// Dump order at startup is links, addresses, routes, then neighbors,
/// so that every owner exists before its dependents and resolved
/// neighbors arrive last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    Links,
    Addrs,
    Routes,
    Neighbors,
}

impl DumpKind {
    /// Startup dump sequence.
    pub const SEQUENCE: [DumpKind; 4] = [
        DumpKind::Links,
        DumpKind::Addrs,
        DumpKind::Routes,
        DumpKind::Neighbors,
    ];
}

/// One socket read's worth of decoded updates.
#[derive(Debug, Default)]
pub struct Batch {
    pub updates: Vec<NetUpdate>,
    /// True when the read contained an NLMSG_DONE marker (end of a
    /// table dump).
    pub done: bool,
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{Batch, DumpKind};
    use crate::error::{NetlinkError, Result};
    use crate::update::{NetAction, NetObject, NetUpdate};
    use flowsync_store::{AddrEntry, LinkEntry, NeighEntry, NextHop, RouteEntry, RouteOrigin};
    use flowsync_types::{AddressFamily, MacAddress, NudState};
    use netlink_packet_core::{
        NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_DUMP, NLM_F_REQUEST,
    };
    use netlink_packet_route::address::{AddressAttribute, AddressMessage};
    use netlink_packet_route::link::{LinkAttribute, LinkMessage};
    use netlink_packet_route::neighbour::{NeighbourAddress, NeighbourAttribute, NeighbourMessage};
    use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
    use netlink_packet_route::RouteNetlinkMessage;
    use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
    use std::net::IpAddr;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use tokio::io::unix::AsyncFd;
    use tracing::{debug, trace, warn};

    // rtnetlink multicast groups (linux/rtnetlink.h)
    const RTNLGRP_LINK: u32 = 1;
    const RTNLGRP_NEIGH: u32 = 3;
    const RTNLGRP_IPV4_IFADDR: u32 = 5;
    const RTNLGRP_IPV4_ROUTE: u32 = 7;
    const RTNLGRP_IPV6_IFADDR: u32 = 9;
    const RTNLGRP_IPV6_ROUTE: u32 = 11;

    /// Socket receive buffer size (1MB) for handling burst loads
    const SOCKET_RECV_BUFFER_SIZE: usize = 1024 * 1024;

    /// Default capacity for pre-allocated update buffer
    const DEFAULT_UPDATE_CAPACITY: usize = 128;

    fn group_bit(group: u32) -> u32 {
        1 << (group - 1)
    }

    /// Netlink socket subscribed to the topology multicast groups.
    pub struct NetlinkSocket {
        socket: Socket,
        /// Pre-allocated receive buffer (reused across calls)
        buffer: Vec<u8>,
        updates_buffer: Vec<NetUpdate>,
    }

    impl NetlinkSocket {
        pub fn new() -> Result<Self> {
            let mut socket = Socket::new(NETLINK_ROUTE)
                .map_err(|e| NetlinkError::socket(format!("Failed to create socket: {}", e)))?;

            let groups = group_bit(RTNLGRP_LINK)
                | group_bit(RTNLGRP_NEIGH)
                | group_bit(RTNLGRP_IPV4_IFADDR)
                | group_bit(RTNLGRP_IPV4_ROUTE)
                | group_bit(RTNLGRP_IPV6_IFADDR)
                | group_bit(RTNLGRP_IPV6_ROUTE);
            let addr = SocketAddr::new(0, groups);
            socket
                .bind(&addr)
                .map_err(|e| NetlinkError::socket(format!("Failed to bind socket: {}", e)))?;

            debug!("netlink socket bound to link/addr/neigh/route groups");

            let nl_socket = Self {
                socket,
                buffer: vec![0u8; 65536],
                updates_buffer: Vec::with_capacity(DEFAULT_UPDATE_CAPACITY),
            };

            nl_socket.tune_socket()?;

            Ok(nl_socket)
        }

        fn set_nonblocking(&self) -> Result<()> {
            let fd = self.socket.as_raw_fd();
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                if flags < 0 {
                    return Err(NetlinkError::socket("Failed to get socket flags"));
                }
                if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                    return Err(NetlinkError::socket("Failed to set non-blocking mode"));
                }
            }
            Ok(())
        }

        /// Tune socket buffer settings for high-throughput scenarios
        fn tune_socket(&self) -> Result<()> {
            let fd = self.socket.as_raw_fd();

            unsafe {
                let size = SOCKET_RECV_BUFFER_SIZE as libc::c_int;
                let ret = libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVBUF,
                    &size as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
                if ret < 0 {
                    warn!("Failed to set SO_RCVBUF, using default buffer size");
                } else {
                    debug!(size = SOCKET_RECV_BUFFER_SIZE, "Set socket receive buffer");
                }

                // Enable NETLINK_NO_ENOBUFS to prevent ENOBUFS errors under load
                let enable: libc::c_int = 1;
                let ret = libc::setsockopt(
                    fd,
                    libc::SOL_NETLINK,
                    libc::NETLINK_NO_ENOBUFS,
                    &enable as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
                if ret < 0 {
                    warn!("Failed to set NETLINK_NO_ENOBUFS");
                } else {
                    debug!("Enabled NETLINK_NO_ENOBUFS");
                }
            }

            Ok(())
        }

        pub fn as_raw_fd(&self) -> i32 {
            self.socket.as_raw_fd()
        }

        /// Requests a dump of one kernel table. Only one dump may be in
        /// flight per socket; drive the next request after the DONE
        /// marker for this one.
        pub fn request_dump(&mut self, kind: DumpKind) -> Result<()> {
            let mut header = NetlinkHeader::default();
            header.flags = NLM_F_REQUEST | NLM_F_DUMP;

            let payload = match kind {
                DumpKind::Links => RouteNetlinkMessage::GetLink(LinkMessage::default()),
                DumpKind::Addrs => RouteNetlinkMessage::GetAddress(AddressMessage::default()),
                DumpKind::Routes => RouteNetlinkMessage::GetRoute(RouteMessage::default()),
                DumpKind::Neighbors => {
                    RouteNetlinkMessage::GetNeighbour(NeighbourMessage::default())
                }
            };
            let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
            packet.finalize();

            let bytes = packet.buffer_len();
            let mut buf = vec![0u8; bytes];
            packet.serialize(&mut buf);

            self.socket
                .send(&buf, 0)
                .map_err(|e| NetlinkError::socket(format!("Failed to send dump request: {}", e)))?;

            debug!(?kind, "requested table dump");
            Ok(())
        }

        /// Receive and decode updates (blocking).
        pub fn receive_updates(&mut self) -> Result<Batch> {
            let len = self
                .socket
                .recv(&mut self.buffer, 0)
                .map_err(|e| NetlinkError::socket(format!("Failed to receive: {}", e)))?;

            Ok(self.parse_buffer(len))
        }

        /// Receive updates with non-blocking semantics; `Ok(None)` when
        /// no data is available (EAGAIN/EWOULDBLOCK).
        pub fn try_receive_updates(&mut self) -> Result<Option<Batch>> {
            match self.socket.recv(&mut self.buffer, libc::MSG_DONTWAIT) {
                Ok(len) => Ok(Some(self.parse_buffer(len))),
                Err(e) => {
                    let errno = std::io::Error::last_os_error();
                    if errno.raw_os_error() == Some(libc::EAGAIN)
                        || errno.raw_os_error() == Some(libc::EWOULDBLOCK)
                    {
                        Ok(None)
                    } else {
                        Err(NetlinkError::socket(format!("Failed to receive: {}", e)))
                    }
                }
            }
        }

        fn parse_buffer(&mut self, len: usize) -> Batch {
            self.updates_buffer.clear();
            let done = parse_slice(&self.buffer[..len], &mut self.updates_buffer);

            trace!(count = self.updates_buffer.len(), done, "received updates");

            Batch {
                updates: std::mem::take(&mut self.updates_buffer),
                done,
            }
        }
    }

    /// struct nlmsghdr size.
    const NLMSG_HDRLEN: usize = 16;

    /// Walks one receive buffer's worth of netlink messages. A message
    /// that fails to decode is skipped over by its header length; the
    /// rest of the batch still applies. Returns true when an NLMSG_DONE
    /// marker was seen.
    fn parse_slice(buf: &[u8], updates: &mut Vec<NetUpdate>) -> bool {
        let mut done = false;
        let mut offset = 0;

        while offset + NLMSG_HDRLEN <= buf.len() {
            let msg_len = u32::from_ne_bytes([
                buf[offset],
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
            ]) as usize;
            if msg_len < NLMSG_HDRLEN || offset + msg_len > buf.len() {
                warn!(offset, msg_len, "truncated netlink message, discarding rest of batch");
                break;
            }

            match NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buf[offset..offset + msg_len])
            {
                Ok(msg) => match &msg.payload {
                    NetlinkPayload::Done(_) => done = true,
                    NetlinkPayload::Error(e) => {
                        warn!(error = ?e, "netlink error message, discarding");
                    }
                    _ => {
                        if let Some(update) = parse_message(&msg) {
                            updates.push(update);
                        }
                    }
                },
                // One undecodable message never aborts the batch or the
                // process.
                Err(e) => warn!(error = %e, "discarding undecodable netlink message"),
            }

            offset += msg_len;
            // Align to 4 bytes (netlink alignment requirement)
            offset = (offset + 3) & !3;
        }

        done
    }

    /// Decodes one rtnetlink message into a normalized update. Messages
    /// about kinds or families we do not track decode to `None`.
    fn parse_message(msg: &NetlinkMessage<RouteNetlinkMessage>) -> Option<NetUpdate> {
        let NetlinkPayload::InnerMessage(inner) = &msg.payload else {
            return None;
        };

        match inner {
            RouteNetlinkMessage::NewLink(m) => {
                Some(NetUpdate::new(NetAction::New, NetObject::Link(parse_link(m))))
            }
            RouteNetlinkMessage::DelLink(m) => {
                Some(NetUpdate::new(NetAction::Del, NetObject::Link(parse_link(m))))
            }
            RouteNetlinkMessage::NewAddress(m) => {
                Some(NetUpdate::new(NetAction::New, NetObject::Addr(parse_addr(m)?)))
            }
            RouteNetlinkMessage::DelAddress(m) => {
                Some(NetUpdate::new(NetAction::Del, NetObject::Addr(parse_addr(m)?)))
            }
            RouteNetlinkMessage::NewNeighbour(m) => {
                Some(NetUpdate::new(NetAction::New, NetObject::Neigh(parse_neigh(m)?)))
            }
            RouteNetlinkMessage::DelNeighbour(m) => {
                Some(NetUpdate::new(NetAction::Del, NetObject::Neigh(parse_neigh(m)?)))
            }
            RouteNetlinkMessage::NewRoute(m) => {
                Some(NetUpdate::new(NetAction::New, NetObject::Route(parse_route(m)?)))
            }
            RouteNetlinkMessage::DelRoute(m) => {
                Some(NetUpdate::new(NetAction::Del, NetObject::Route(parse_route(m)?)))
            }
            _ => None,
        }
    }

    fn parse_link(msg: &LinkMessage) -> LinkEntry {
        let mut name = String::new();
        let mut lladdr = MacAddress::ZERO;
        let mut broadcast = MacAddress::BROADCAST;
        let mut mtu = 0u32;

        for attr in &msg.attributes {
            match attr {
                LinkAttribute::IfName(n) => name = n.clone(),
                LinkAttribute::Address(bytes) => {
                    if let Some(mac) = MacAddress::from_bytes(bytes) {
                        lladdr = mac;
                    }
                }
                LinkAttribute::Broadcast(bytes) => {
                    if let Some(mac) = MacAddress::from_bytes(bytes) {
                        broadcast = mac;
                    }
                }
                LinkAttribute::Mtu(m) => mtu = *m,
                _ => {}
            }
        }

        LinkEntry {
            ifindex: msg.header.index,
            name,
            lladdr,
            broadcast,
            flags: msg.header.flags.bits(),
            mtu,
            hw_type: u16::from(msg.header.link_layer_type),
        }
    }

    fn parse_addr(msg: &AddressMessage) -> Option<AddrEntry> {
        let family = AddressFamily::from_kernel(u8::from(msg.header.family))?;

        let mut local: Option<IpAddr> = None;
        let mut address: Option<IpAddr> = None;
        let mut broadcast: Option<IpAddr> = None;

        for attr in &msg.attributes {
            match attr {
                AddressAttribute::Local(ip) => local = Some(*ip),
                AddressAttribute::Address(ip) => address = Some(*ip),
                AddressAttribute::Broadcast(ip) => broadcast = Some(IpAddr::V4(*ip)),
                _ => {}
            }
        }

        // IFA_LOCAL is the interface address; IFA_ADDRESS is the peer
        // on point-to-point links and a duplicate otherwise.
        let local = local.or(address)?;
        let peer = address.filter(|a| *a != local);

        Some(AddrEntry {
            ifindex: msg.header.index,
            family,
            prefix_len: msg.header.prefix_len,
            local,
            peer,
            broadcast,
            scope: u8::from(msg.header.scope),
            flags: u32::from(msg.header.flags.bits()),
        })
    }

    fn parse_neigh(msg: &NeighbourMessage) -> Option<NeighEntry> {
        let family = AddressFamily::from_kernel(u8::from(msg.header.family))?;

        let mut dst: Option<IpAddr> = None;
        let mut lladdr = MacAddress::ZERO;

        for attr in &msg.attributes {
            match attr {
                NeighbourAttribute::Destination(addr) => {
                    dst = neigh_address(addr);
                }
                NeighbourAttribute::LinkLocalAddress(bytes) => {
                    if let Some(mac) = MacAddress::from_bytes(bytes) {
                        lladdr = mac;
                    }
                }
                _ => {}
            }
        }

        let dst = dst?;

        Some(NeighEntry {
            ifindex: msg.header.ifindex,
            family,
            dst,
            lladdr,
            state: NudState::from_kernel(u16::from(msg.header.state)),
            flags: msg.header.flags.bits(),
            kind: u8::from(msg.header.kind),
        })
    }

    fn neigh_address(addr: &NeighbourAddress) -> Option<IpAddr> {
        match addr {
            NeighbourAddress::Inet(ipv4) => Some(IpAddr::V4(*ipv4)),
            NeighbourAddress::Inet6(ipv6) => Some(IpAddr::V6(*ipv6)),
            _ => None,
        }
    }

    fn route_address(addr: &RouteAddress) -> Option<IpAddr> {
        match addr {
            RouteAddress::Inet(ipv4) => Some(IpAddr::V4(*ipv4)),
            RouteAddress::Inet6(ipv6) => Some(IpAddr::V6(*ipv6)),
            _ => None,
        }
    }

    fn parse_route(msg: &RouteMessage) -> Option<RouteEntry> {
        let family = AddressFamily::from_kernel(u8::from(msg.header.address_family))?;

        let mut table = u32::from(msg.header.table);
        let mut dst: Option<IpAddr> = None;
        let mut src: Option<IpAddr> = None;
        let mut gateway: Option<IpAddr> = None;
        let mut oif = 0u32;
        let mut metric = 0u32;
        let mut nexthops: Vec<NextHop> = Vec::new();

        for attr in &msg.attributes {
            match attr {
                RouteAttribute::Destination(addr) => dst = route_address(addr),
                RouteAttribute::PrefSource(addr) => src = route_address(addr),
                RouteAttribute::Gateway(addr) => gateway = route_address(addr),
                RouteAttribute::Oif(index) => oif = *index,
                RouteAttribute::Priority(p) => metric = *p,
                // RTA_TABLE supersedes the u8 header field.
                RouteAttribute::Table(t) => table = *t,
                RouteAttribute::MultiPath(hops) => {
                    for hop in hops {
                        let mut hop_gateway = None;
                        for hop_attr in &hop.attributes {
                            if let RouteAttribute::Gateway(addr) = hop_attr {
                                hop_gateway = route_address(addr);
                            }
                        }
                        nexthops.push(NextHop {
                            weight: hop.hops,
                            gateway: hop_gateway,
                            ifindex: hop.interface_index,
                        });
                    }
                }
                _ => {}
            }
        }

        // A route without RTA_DST is the default route.
        let dst_addr = dst.unwrap_or(match family {
            AddressFamily::Ipv4 => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            AddressFamily::Ipv6 => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
        });
        let dst = flowsync_types::IpPrefix::new(dst_addr, msg.header.destination_prefix_length)
            .ok()?;

        if nexthops.is_empty() {
            nexthops.push(NextHop {
                weight: 1,
                gateway,
                ifindex: oif,
            });
        }

        Some(RouteEntry {
            table,
            scope: u8::from(msg.header.scope),
            dst,
            src,
            oif,
            metric,
            protocol: u8::from(msg.header.protocol),
            priority: metric,
            nexthops,
            origin: RouteOrigin::Kernel,
        })
    }

    /// Async netlink socket wrapper using tokio's epoll integration.
    pub struct AsyncNetlinkSocket {
        inner: AsyncFd<OwnedFd>,
        socket: NetlinkSocket,
    }

    impl AsyncNetlinkSocket {
        pub fn new() -> Result<Self> {
            let socket = NetlinkSocket::new()?;
            socket.set_nonblocking()?;

            // Dup the fd for AsyncFd so Socket retains ownership.
            let fd = socket.as_raw_fd();
            let owned_fd = unsafe {
                let new_fd = libc::dup(fd);
                if new_fd < 0 {
                    return Err(NetlinkError::socket("Failed to dup fd"));
                }
                OwnedFd::from_raw_fd(new_fd)
            };

            let async_fd = AsyncFd::new(owned_fd)
                .map_err(|e| NetlinkError::socket(format!("Failed to create AsyncFd: {}", e)))?;

            debug!("created async netlink socket with epoll integration");

            Ok(Self {
                inner: async_fd,
                socket,
            })
        }

        /// Receives the next batch of decoded updates, yielding to the
        /// runtime while the socket has no data.
        pub async fn recv_updates(&mut self) -> Result<Batch> {
            loop {
                let mut guard = self
                    .inner
                    .readable()
                    .await
                    .map_err(|e| NetlinkError::socket(format!("AsyncFd readable error: {}", e)))?;

                match guard.try_io(|_| {
                    self.socket
                        .try_receive_updates()
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
                }) {
                    Ok(Ok(Some(batch))) => return Ok(batch),
                    Ok(Ok(None)) => {
                        guard.clear_ready();
                        continue;
                    }
                    Ok(Err(e)) => {
                        return Err(NetlinkError::socket(format!("Receive error: {}", e)));
                    }
                    Err(_would_block) => continue,
                }
            }
        }

        pub fn request_dump(&mut self, kind: DumpKind) -> Result<()> {
            self.socket.request_dump(kind)
        }

        pub fn as_raw_fd(&self) -> i32 {
            self.socket.as_raw_fd()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn raw_message(len: u32, msg_type: u16, payload: &[u8]) -> Vec<u8> {
            let mut buf = Vec::new();
            buf.extend_from_slice(&len.to_ne_bytes());
            buf.extend_from_slice(&msg_type.to_ne_bytes());
            buf.extend_from_slice(&0u16.to_ne_bytes()); // flags
            buf.extend_from_slice(&1u32.to_ne_bytes()); // seq
            buf.extend_from_slice(&0u32.to_ne_bytes()); // pid
            buf.extend_from_slice(payload);
            buf
        }

        #[test]
        fn test_undecodable_message_is_skipped_not_fatal() {
            // An unknown message type in the middle of a batch must not
            // abort it; the DONE marker behind it still lands.
            let mut buf = raw_message(20, 0x7abc, &[0u8; 4]);
            buf.extend(raw_message(20, 3, &0u32.to_ne_bytes()));

            let mut updates = Vec::new();
            let done = parse_slice(&buf, &mut updates);

            assert!(done);
            assert!(updates.is_empty());
        }

        #[test]
        fn test_truncated_message_ends_batch() {
            // Header claims more bytes than the buffer holds.
            let buf = raw_message(64, 3, &[0u8; 4]);

            let mut updates = Vec::new();
            let done = parse_slice(&buf, &mut updates);

            assert!(!done);
            assert!(updates.is_empty());
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::*;

/// Mock implementation for non-Linux platforms (development only)
#[cfg(not(target_os = "linux"))]
mod mock {
    use super::{Batch, DumpKind};
    use crate::error::Result;

    pub struct NetlinkSocket;

    impl NetlinkSocket {
        pub fn new() -> Result<Self> {
            Ok(Self)
        }

        pub fn as_raw_fd(&self) -> i32 {
            -1
        }

        pub fn request_dump(&mut self, _kind: DumpKind) -> Result<()> {
            Ok(())
        }

        pub fn receive_updates(&mut self) -> Result<Batch> {
            Ok(Batch {
                updates: Vec::new(),
                done: true,
            })
        }

        pub fn try_receive_updates(&mut self) -> Result<Option<Batch>> {
            Ok(None)
        }
    }

    /// Mock async netlink socket for non-Linux platforms
    pub struct AsyncNetlinkSocket;

    impl AsyncNetlinkSocket {
        pub fn new() -> Result<Self> {
            Ok(Self)
        }

        pub async fn recv_updates(&mut self) -> Result<Batch> {
            // In mock, just sleep to prevent busy-loop in tests
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            Ok(Batch {
                updates: Vec::new(),
                done: true,
            })
        }

        pub fn request_dump(&mut self, _kind: DumpKind) -> Result<()> {
            Ok(())
        }

        pub fn as_raw_fd(&self) -> i32 {
            -1
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use mock::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_sequence_order() {
        assert_eq!(
            DumpKind::SEQUENCE,
            [
                DumpKind::Links,
                DumpKind::Addrs,
                DumpKind::Routes,
                DumpKind::Neighbors
            ]
        );
    }
}
