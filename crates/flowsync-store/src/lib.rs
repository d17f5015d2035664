//! Indexed, in-memory snapshot of the kernel's network topology.
//!
//! The store holds one entry per observed link, address, neighbor and
//! route. It is mutated only by the netlink event source (or the route
//! injection API used by protocol snoopers) and read by the projection
//! layer, which correlates installed forwarding-element state with store
//! entries through the stable per-entry indices allocated here.
//!
//! # Identity rules
//!
//! - Links are keyed by the kernel-assigned interface index.
//! - Addresses and neighbors are keyed by a *link-scoped* index: the
//!   smallest unused non-negative integer within their link at first
//!   observation. Re-observation (same family + local address for
//!   addresses, same destination for neighbors) updates the existing
//!   entry in place and keeps its index.
//! - Routes are keyed by (table id, dense per-table index); two
//!   observations are the same route when (table, scope, outgoing
//!   interface, destination) match.
//!
//! No locking: the store is only ever touched from the single
//! event-loop thread.

mod entry;
mod event;
mod store;

pub use entry::{AddrEntry, LinkEntry, NeighEntry, NextHop, RouteEntry, RouteOrigin};
pub use event::{EventSink, Fanout, SinkToken, StoreEvent};
pub use store::{NetStore, StoreStats, TopologySnapshot};

use thiserror::Error;

/// Key of an address or neighbor entry: owning link + link-scoped index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct LinkScopedKey {
    pub ifindex: u32,
    pub index: u32,
}

impl LinkScopedKey {
    pub const fn new(ifindex: u32, index: u32) -> Self {
        Self { ifindex, index }
    }
}

impl std::fmt::Display for LinkScopedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "link {} #{}", self.ifindex, self.index)
    }
}

/// Key of a route entry: routing table + dense per-table index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct RouteKey {
    pub table: u32,
    pub index: u32,
}

impl RouteKey {
    pub const fn new(table: u32, index: u32) -> Self {
        Self { table, index }
    }
}

impl std::fmt::Display for RouteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "table {} #{}", self.table, self.index)
    }
}

/// Errors returned by store lookups.
///
/// Only lookups fail; `remove` on an unknown key is a no-op and upsert
/// always succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("link {0} not found")]
    LinkNotFound(u32),

    #[error("address {0} not found")]
    AddrNotFound(LinkScopedKey),

    #[error("neighbor {0} not found")]
    NeighNotFound(LinkScopedKey),

    #[error("route {0} not found")]
    RouteNotFound(RouteKey),
}

impl StoreError {
    /// All store errors are lookup misses; recoverable by definition.
    pub fn is_not_found(&self) -> bool {
        true
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
