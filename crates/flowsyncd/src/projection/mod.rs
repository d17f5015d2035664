//! Flow projection layer: per-object-kind translators from store
//! entries to installed forwarding-element state.
//!
//! Each projector owns the mapping `store key -> installed FlowRule`.
//! A key present in that map is Attached; absent is Detached. Installs
//! record the exact rule issued so the uninstall can rebuild the same
//! strict-delete match, and so a re-observation that changes nothing
//! issues nothing.
//!
//! Failure discipline (shared by all projectors): a store lookup miss
//! while building a rule skips that single operation; channel
//! unavailability leaves the key Detached for the next resync;
//! congestion drops the write and counts it.

pub mod addr;
pub mod neigh;
pub mod port;
pub mod route;

pub use addr::AddrProjector;
pub use neigh::NeighProjector;
pub use port::{PortForwardState, PortProjector};
pub use route::RouteProjector;

use flowsync_dataplane::{DataplaneChannel, DataplaneError, FlowMod};
use flowsync_store::{LinkScopedKey, NetStore, RouteKey};
use flowsync_types::PortNo;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Saturating counters shared by every projector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectionStats {
    pub installs: u64,
    pub uninstalls: u64,
    /// Operations skipped because the channel was not established.
    pub skipped_unavailable: u64,
    /// Writes dropped by southbound congestion (not retried).
    pub dropped_congested: u64,
    /// Rules not built because a store lookup missed.
    pub lookup_misses: u64,
}

impl ProjectionStats {
    pub(crate) fn miss(&mut self) {
        self.lookup_misses = self.lookup_misses.saturating_add(1);
    }
}

/// Issues one flow mod, absorbing recoverable failures per the shared
/// discipline. Returns true when the write was queued.
pub(crate) fn issue(
    channel: &dyn DataplaneChannel,
    flow: &FlowMod,
    stats: &mut ProjectionStats,
) -> bool {
    match channel.send_flow(flow) {
        Ok(()) => {
            if flow.is_add() {
                stats.installs = stats.installs.saturating_add(1);
            } else {
                stats.uninstalls = stats.uninstalls.saturating_add(1);
            }
            true
        }
        Err(DataplaneError::ChannelUnavailable { state }) => {
            debug!(?state, "channel not established, skipping flow mod");
            stats.skipped_unavailable = stats.skipped_unavailable.saturating_add(1);
            false
        }
        Err(DataplaneError::Congested) => {
            warn!("southbound congested, dropping flow mod");
            stats.dropped_congested = stats.dropped_congested.saturating_add(1);
            false
        }
        Err(e) => {
            warn!(error = %e, "flow mod failed");
            false
        }
    }
}

// Cookie layout: kind tag in the top byte, then the key components.
const COOKIE_KIND_ADDR: u64 = 0x01;
const COOKIE_KIND_NEIGH: u64 = 0x02;
const COOKIE_KIND_ROUTE: u64 = 0x03;
const COOKIE_KIND_PORT: u64 = 0x04;
const COOKIE_KIND_BASELINE: u64 = 0x0f;

pub(crate) fn addr_cookie(key: LinkScopedKey) -> u64 {
    COOKIE_KIND_ADDR << 56 | u64::from(key.ifindex) << 24 | u64::from(key.index)
}

pub(crate) fn neigh_cookie(key: LinkScopedKey) -> u64 {
    COOKIE_KIND_NEIGH << 56 | u64::from(key.ifindex) << 24 | u64::from(key.index)
}

pub(crate) fn route_cookie(key: RouteKey) -> u64 {
    COOKIE_KIND_ROUTE << 56 | u64::from(key.table) << 24 | u64::from(key.index)
}

pub(crate) fn port_cookie(port: PortNo) -> u64 {
    COOKIE_KIND_PORT << 56 | u64::from(port.0)
}

pub(crate) fn baseline_cookie(slot: u64) -> u64 {
    COOKIE_KIND_BASELINE << 56 | slot
}

/// Kernel-link to forwarding-element-port correlation, fed by
/// port-status events and consulted by the route and neighbor
/// projectors when choosing an output port.
#[derive(Debug, Default)]
pub struct PortMap {
    by_name: BTreeMap<String, PortNo>,
}

impl PortMap {
    pub fn insert(&mut self, name: String, port: PortNo) {
        self.by_name.insert(name, port);
    }

    pub fn remove(&mut self, name: &str) {
        self.by_name.remove(name);
    }

    pub fn get(&self, name: &str) -> Option<PortNo> {
        self.by_name.get(name).copied()
    }

    /// Resolves a kernel link to its forwarding-element port by device
    /// name. `None` when the link is unknown or has no matching port.
    pub fn port_for_link(&self, store: &NetStore, ifindex: u32) -> Option<PortNo> {
        let link = store.get_link(ifindex).ok()?;
        self.get(&link.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cookie_kinds_disjoint() {
        let key = LinkScopedKey::new(3, 0);
        let rkey = RouteKey::new(3, 0);
        let cookies = [
            addr_cookie(key),
            neigh_cookie(key),
            route_cookie(rkey),
            baseline_cookie(0),
        ];
        for (i, a) in cookies.iter().enumerate() {
            for b in cookies.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_port_map_resolution() {
        use flowsync_store::LinkEntry;
        use flowsync_types::MacAddress;

        let mut store = NetStore::new();
        store.upsert_link(LinkEntry {
            ifindex: 3,
            name: "fs0".into(),
            lladdr: MacAddress::ZERO,
            broadcast: MacAddress::BROADCAST,
            flags: 0x1,
            mtu: 1500,
            hw_type: 1,
        });

        let mut ports = PortMap::default();
        ports.insert("fs0".into(), PortNo(7));

        assert_eq!(ports.port_for_link(&store, 3), Some(PortNo(7)));
        assert_eq!(ports.port_for_link(&store, 4), None);
        ports.remove("fs0");
        assert_eq!(ports.port_for_link(&store, 3), None);
    }
}
