//! Store entry types for the four tracked kernel object kinds.

use flowsync_types::{AddressFamily, IpPrefix, MacAddress, NudState};
use serde::Serialize;
use std::net::IpAddr;

/// A kernel network link (interface).
///
/// Identity is the kernel-assigned interface index; the store never
/// allocates link indices itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkEntry {
    /// Kernel interface index.
    pub ifindex: u32,
    /// Device name (e.g. "eth0").
    pub name: String,
    /// Link-layer address.
    pub lladdr: MacAddress,
    /// Link-layer broadcast address.
    pub broadcast: MacAddress,
    /// IFF_* flag bits as reported by the kernel.
    pub flags: u32,
    pub mtu: u32,
    /// ARPHRD_* hardware type.
    pub hw_type: u16,
}

impl LinkEntry {
    /// IFF_UP.
    pub fn is_admin_up(&self) -> bool {
        self.flags & 0x1 != 0
    }

    /// IFF_RUNNING.
    pub fn is_oper_up(&self) -> bool {
        self.flags & 0x40 != 0
    }
}

/// An IP address assigned to a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddrEntry {
    /// Owning link.
    pub ifindex: u32,
    pub family: AddressFamily,
    pub prefix_len: u8,
    /// Local (interface) address; the identity component.
    pub local: IpAddr,
    /// Peer address on point-to-point links.
    pub peer: Option<IpAddr>,
    pub broadcast: Option<IpAddr>,
    /// RT_SCOPE_* value.
    pub scope: u8,
    /// IFA_F_* flag bits.
    pub flags: u32,
}

impl AddrEntry {
    /// The connected prefix this address implies (local address masked
    /// to the prefix length).
    pub fn prefix(&self) -> IpPrefix {
        // prefix_len was validated against the family on ingest
        IpPrefix::new(self.local, self.prefix_len)
            .unwrap_or_else(|_| IpPrefix::host(self.local))
    }

    /// Identity predicate: same address when family and local address
    /// match (spec: flags/scope changes update in place).
    pub fn same_identity(&self, other: &AddrEntry) -> bool {
        self.family == other.family && self.local == other.local
    }
}

/// A neighbor (ARP/NDP) entry on a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NeighEntry {
    /// Owning link.
    pub ifindex: u32,
    pub family: AddressFamily,
    /// Destination address; the identity component.
    pub dst: IpAddr,
    /// Link-layer address; `MacAddress::ZERO` while unresolved.
    pub lladdr: MacAddress,
    /// Kernel NUD state.
    pub state: NudState,
    /// NTF_* flag bits.
    pub flags: u8,
    /// NDA type (NDA_* / RTN_* as reported).
    pub kind: u8,
}

impl NeighEntry {
    /// Identity predicate: keyed by destination address within a link.
    pub fn same_identity(&self, other: &NeighEntry) -> bool {
        self.dst == other.dst
    }
}

/// A single next-hop of a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NextHop {
    /// ECMP weight (1 for single-path routes).
    pub weight: u8,
    /// Gateway address; `None` for directly connected hops.
    pub gateway: Option<IpAddr>,
    /// Outgoing link of this hop.
    pub ifindex: u32,
}

/// Who put a route into the store.
///
/// Injected routes (protocol snoopers such as the DHCP delegation
/// watcher) are withdrawn explicitly, never by kernel delete
/// notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RouteOrigin {
    Kernel,
    Injected,
}

/// A route in some kernel routing table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteEntry {
    /// Routing table id.
    pub table: u32,
    /// RT_SCOPE_* value.
    pub scope: u8,
    /// Destination prefix.
    pub dst: IpPrefix,
    /// Preferred source address, if any.
    pub src: Option<IpAddr>,
    /// Outgoing interface (0 when only next-hops carry one).
    pub oif: u32,
    pub metric: u32,
    /// RTPROT_* value.
    pub protocol: u8,
    pub priority: u32,
    /// Ordered next-hop list; at least one entry for usable routes.
    pub nexthops: Vec<NextHop>,
    pub origin: RouteOrigin,
}

impl RouteEntry {
    /// Identity predicate: (table, scope, outgoing interface,
    /// destination) per the reconciliation contract.
    pub fn same_identity(&self, other: &RouteEntry) -> bool {
        self.table == other.table
            && self.scope == other.scope
            && self.oif == other.oif
            && self.dst == other.dst
    }
}
