//! Normalized kernel notifications.
//!
//! The socket layer parses raw netlink messages into [`NetUpdate`]s so
//! the ingest path (and its tests) never touch wire formats.

use flowsync_store::{AddrEntry, LinkEntry, NeighEntry, RouteEntry};

/// What the kernel did to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetAction {
    New,
    Change,
    Del,
}

/// The object a notification is about, already decoded into the store's
/// entry types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetObject {
    Link(LinkEntry),
    Addr(AddrEntry),
    Neigh(NeighEntry),
    Route(RouteEntry),
}

impl NetObject {
    pub fn kind(&self) -> &'static str {
        match self {
            NetObject::Link(_) => "link",
            NetObject::Addr(_) => "addr",
            NetObject::Neigh(_) => "neigh",
            NetObject::Route(_) => "route",
        }
    }
}

/// One normalized kernel notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetUpdate {
    pub action: NetAction,
    pub object: NetObject,
}

impl NetUpdate {
    pub fn new(action: NetAction, object: NetObject) -> Self {
        Self { action, object }
    }
}
