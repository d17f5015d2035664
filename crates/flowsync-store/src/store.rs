//! The store proper: indexed tables plus identity-preserving upserts.

use crate::entry::{AddrEntry, LinkEntry, NeighEntry, RouteEntry, RouteOrigin};
use crate::{LinkScopedKey, Result, RouteKey, StoreError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::trace;

/// Saturating counters for store activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub created: u64,
    pub updated: u64,
    pub removed: u64,
    /// `remove` calls that hit no entry (no-ops, by contract).
    pub remove_misses: u64,
}

/// Read-only view of the current topology for the export collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct TopologySnapshot {
    pub links: Vec<LinkEntry>,
    pub addrs: Vec<AddrEntry>,
    pub neighs: Vec<NeighEntry>,
    pub routes: Vec<RouteEntry>,
}

/// The netlink object store.
///
/// Mutation happens only through the event-source ingest path (and the
/// route injection API); projections and exporters read. Identity
/// resolution on upsert is a linear scan of the owning link/table by
/// design — per-link and per-table object counts are small. The first
/// optimization target for larger deployments is a secondary index from
/// identity to slot.
#[derive(Debug, Default)]
pub struct NetStore {
    links: BTreeMap<u32, LinkEntry>,
    addrs: BTreeMap<u32, BTreeMap<u32, AddrEntry>>,
    neighs: BTreeMap<u32, BTreeMap<u32, NeighEntry>>,
    routes: BTreeMap<u32, BTreeMap<u32, RouteEntry>>,
    stats: StoreStats,
}

/// Smallest unused non-negative integer in an index table.
fn smallest_free_index<V>(table: &BTreeMap<u32, V>) -> u32 {
    let mut candidate = 0u32;
    for key in table.keys() {
        if *key == candidate {
            candidate += 1;
        } else {
            break;
        }
    }
    candidate
}

impl NetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> StoreStats {
        self.stats
    }

    // ------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------

    /// Inserts or updates a link. Returns the interface index and
    /// whether the entry was newly created.
    pub fn upsert_link(&mut self, link: LinkEntry) -> (u32, bool) {
        let ifindex = link.ifindex;
        let created = self.links.insert(ifindex, link).is_none();
        self.bump(created);
        trace!(ifindex, created, "link upsert");
        (ifindex, created)
    }

    pub fn get_link(&self, ifindex: u32) -> Result<&LinkEntry> {
        self.links
            .get(&ifindex)
            .ok_or(StoreError::LinkNotFound(ifindex))
    }

    /// Removes a link. Unknown indices are a no-op, never an error.
    /// The link's address and neighbor tables are dropped with it; the
    /// ingest layer is responsible for announcing those deletions first.
    pub fn remove_link(&mut self, ifindex: u32) {
        if self.links.remove(&ifindex).is_some() {
            self.addrs.remove(&ifindex);
            self.neighs.remove(&ifindex);
            self.stats.removed = self.stats.removed.saturating_add(1);
        } else {
            self.stats.remove_misses = self.stats.remove_misses.saturating_add(1);
        }
    }

    pub fn links(&self) -> impl Iterator<Item = &LinkEntry> {
        self.links.values()
    }

    // ------------------------------------------------------------------
    // Addresses
    // ------------------------------------------------------------------

    /// Inserts or updates an address under its link.
    ///
    /// Identity is (family, local address): a re-observation updates the
    /// existing entry in place and returns its original index, so the
    /// projection layer's correlation with installed rules stays stable.
    pub fn upsert_addr(&mut self, addr: AddrEntry) -> (LinkScopedKey, bool) {
        let ifindex = addr.ifindex;
        let table = self.addrs.entry(ifindex).or_default();

        if let Some((index, slot)) = table.iter_mut().find(|(_, e)| e.same_identity(&addr)) {
            let key = LinkScopedKey::new(ifindex, *index);
            *slot = addr;
            self.bump(false);
            trace!(%key, "addr updated in place");
            return (key, false);
        }

        let index = smallest_free_index(table);
        table.insert(index, addr);
        self.bump(true);
        let key = LinkScopedKey::new(ifindex, index);
        trace!(%key, "addr created");
        (key, true)
    }

    pub fn get_addr(&self, key: LinkScopedKey) -> Result<&AddrEntry> {
        self.addrs
            .get(&key.ifindex)
            .and_then(|t| t.get(&key.index))
            .ok_or(StoreError::AddrNotFound(key))
    }

    /// Finds an address by its identity components.
    pub fn find_addr(&self, ifindex: u32, local: IpAddr) -> Option<LinkScopedKey> {
        self.addrs.get(&ifindex).and_then(|t| {
            t.iter()
                .find(|(_, e)| e.local == local)
                .map(|(index, _)| LinkScopedKey::new(ifindex, *index))
        })
    }

    pub fn remove_addr(&mut self, key: LinkScopedKey) {
        let removed = self
            .addrs
            .get_mut(&key.ifindex)
            .and_then(|t| t.remove(&key.index))
            .is_some();
        if removed {
            self.stats.removed = self.stats.removed.saturating_add(1);
        } else {
            self.stats.remove_misses = self.stats.remove_misses.saturating_add(1);
        }
    }

    pub fn addrs(&self) -> impl Iterator<Item = (LinkScopedKey, &AddrEntry)> {
        self.addrs.iter().flat_map(|(ifindex, table)| {
            table
                .iter()
                .map(|(index, e)| (LinkScopedKey::new(*ifindex, *index), e))
        })
    }

    pub fn addr_keys_for_link(&self, ifindex: u32) -> Vec<LinkScopedKey> {
        self.addrs
            .get(&ifindex)
            .map(|t| {
                t.keys()
                    .map(|index| LinkScopedKey::new(ifindex, *index))
                    .collect()
            })
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Neighbors
    // ------------------------------------------------------------------

    /// Inserts or updates a neighbor under its link; identity is the
    /// destination address, index allocation as for addresses.
    pub fn upsert_neigh(&mut self, neigh: NeighEntry) -> (LinkScopedKey, bool) {
        let ifindex = neigh.ifindex;
        let table = self.neighs.entry(ifindex).or_default();

        if let Some((index, slot)) = table.iter_mut().find(|(_, e)| e.same_identity(&neigh)) {
            let key = LinkScopedKey::new(ifindex, *index);
            *slot = neigh;
            self.bump(false);
            trace!(%key, "neigh updated in place");
            return (key, false);
        }

        let index = smallest_free_index(table);
        table.insert(index, neigh);
        self.bump(true);
        let key = LinkScopedKey::new(ifindex, index);
        trace!(%key, "neigh created");
        (key, true)
    }

    pub fn get_neigh(&self, key: LinkScopedKey) -> Result<&NeighEntry> {
        self.neighs
            .get(&key.ifindex)
            .and_then(|t| t.get(&key.index))
            .ok_or(StoreError::NeighNotFound(key))
    }

    pub fn find_neigh(&self, ifindex: u32, dst: IpAddr) -> Option<LinkScopedKey> {
        self.neighs.get(&ifindex).and_then(|t| {
            t.iter()
                .find(|(_, e)| e.dst == dst)
                .map(|(index, _)| LinkScopedKey::new(ifindex, *index))
        })
    }

    pub fn remove_neigh(&mut self, key: LinkScopedKey) {
        let removed = self
            .neighs
            .get_mut(&key.ifindex)
            .and_then(|t| t.remove(&key.index))
            .is_some();
        if removed {
            self.stats.removed = self.stats.removed.saturating_add(1);
        } else {
            self.stats.remove_misses = self.stats.remove_misses.saturating_add(1);
        }
    }

    pub fn neighs(&self) -> impl Iterator<Item = (LinkScopedKey, &NeighEntry)> {
        self.neighs.iter().flat_map(|(ifindex, table)| {
            table
                .iter()
                .map(|(index, e)| (LinkScopedKey::new(*ifindex, *index), e))
        })
    }

    pub fn neigh_keys_for_link(&self, ifindex: u32) -> Vec<LinkScopedKey> {
        self.neighs
            .get(&ifindex)
            .map(|t| {
                t.keys()
                    .map(|index| LinkScopedKey::new(ifindex, *index))
                    .collect()
            })
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Routes
    // ------------------------------------------------------------------

    /// Inserts or updates a route; identity is (table, scope, outgoing
    /// interface, destination), index allocation is dense per table.
    pub fn upsert_route(&mut self, route: RouteEntry) -> (RouteKey, bool) {
        let table_id = route.table;
        let table = self.routes.entry(table_id).or_default();

        if let Some((index, slot)) = table.iter_mut().find(|(_, e)| e.same_identity(&route)) {
            let key = RouteKey::new(table_id, *index);
            *slot = route;
            self.bump(false);
            trace!(%key, "route updated in place");
            return (key, false);
        }

        let index = smallest_free_index(table);
        table.insert(index, route);
        self.bump(true);
        let key = RouteKey::new(table_id, index);
        trace!(%key, "route created");
        (key, true)
    }

    pub fn get_route(&self, key: RouteKey) -> Result<&RouteEntry> {
        self.routes
            .get(&key.table)
            .and_then(|t| t.get(&key.index))
            .ok_or(StoreError::RouteNotFound(key))
    }

    /// Finds a route by its identity components.
    pub fn find_route(&self, probe: &RouteEntry) -> Option<RouteKey> {
        self.routes.get(&probe.table).and_then(|t| {
            t.iter()
                .find(|(_, e)| e.same_identity(probe))
                .map(|(index, _)| RouteKey::new(probe.table, *index))
        })
    }

    pub fn remove_route(&mut self, key: RouteKey) {
        let removed = self
            .routes
            .get_mut(&key.table)
            .and_then(|t| t.remove(&key.index))
            .is_some();
        if removed {
            self.stats.removed = self.stats.removed.saturating_add(1);
        } else {
            self.stats.remove_misses = self.stats.remove_misses.saturating_add(1);
        }
    }

    pub fn routes(&self) -> impl Iterator<Item = (RouteKey, &RouteEntry)> {
        self.routes.iter().flat_map(|(table, entries)| {
            entries
                .iter()
                .map(|(index, e)| (RouteKey::new(*table, *index), e))
        })
    }

    /// Finds an injected (snooper-originated) route for withdrawal.
    pub fn find_injected_route(
        &self,
        table: u32,
        dst: flowsync_types::IpPrefix,
    ) -> Option<RouteKey> {
        self.routes.get(&table).and_then(|t| {
            t.iter()
                .find(|(_, e)| e.origin == RouteOrigin::Injected && e.dst == dst)
                .map(|(index, _)| RouteKey::new(table, *index))
        })
    }

    // ------------------------------------------------------------------
    // Snapshot
    // ------------------------------------------------------------------

    /// Materializes a read-only topology view. The exporter must not
    /// mutate the store, so it gets owned copies.
    pub fn snapshot(&self) -> TopologySnapshot {
        TopologySnapshot {
            links: self.links().cloned().collect(),
            addrs: self.addrs().map(|(_, e)| e.clone()).collect(),
            neighs: self.neighs().map(|(_, e)| e.clone()).collect(),
            routes: self.routes().map(|(_, e)| e.clone()).collect(),
        }
    }

    pub fn entry_count(&self) -> usize {
        self.links.len()
            + self.addrs.values().map(BTreeMap::len).sum::<usize>()
            + self.neighs.values().map(BTreeMap::len).sum::<usize>()
            + self.routes.values().map(BTreeMap::len).sum::<usize>()
    }

    fn bump(&mut self, created: bool) {
        if created {
            self.stats.created = self.stats.created.saturating_add(1);
        } else {
            self.stats.updated = self.stats.updated.saturating_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowsync_types::{AddressFamily, MacAddress, NudState};
    use pretty_assertions::assert_eq;

    fn link(ifindex: u32, name: &str) -> LinkEntry {
        LinkEntry {
            ifindex,
            name: name.into(),
            lladdr: MacAddress::ZERO,
            broadcast: MacAddress::BROADCAST,
            flags: 0x1,
            mtu: 1500,
            hw_type: 1,
        }
    }

    fn addr(ifindex: u32, local: &str, flags: u32) -> AddrEntry {
        let local: IpAddr = local.parse().unwrap();
        AddrEntry {
            ifindex,
            family: AddressFamily::from(local),
            prefix_len: 24,
            local,
            peer: None,
            broadcast: None,
            scope: 0,
            flags,
        }
    }

    fn neigh(ifindex: u32, dst: &str, state: NudState) -> NeighEntry {
        let dst: IpAddr = dst.parse().unwrap();
        NeighEntry {
            ifindex,
            family: AddressFamily::from(dst),
            dst,
            lladdr: MacAddress::ZERO,
            state,
            flags: 0,
            kind: 0,
        }
    }

    fn route(table: u32, dst: &str, oif: u32) -> RouteEntry {
        RouteEntry {
            table,
            scope: 0,
            dst: dst.parse().unwrap(),
            src: None,
            oif,
            metric: 0,
            protocol: 2,
            priority: 100,
            nexthops: vec![NextHop {
                weight: 1,
                gateway: None,
                ifindex: oif,
            }],
            origin: RouteOrigin::Kernel,
        }
    }

    use crate::entry::NextHop;

    #[test]
    fn test_addr_index_allocation_smallest_free() {
        let mut store = NetStore::new();
        let (k0, _) = store.upsert_addr(addr(3, "10.0.0.1", 0));
        let (k1, _) = store.upsert_addr(addr(3, "10.0.0.2", 0));
        let (k2, _) = store.upsert_addr(addr(3, "10.0.0.3", 0));
        assert_eq!((k0.index, k1.index, k2.index), (0, 1, 2));

        // Freeing the middle slot makes its index the next allocation.
        store.remove_addr(k1);
        let (k3, created) = store.upsert_addr(addr(3, "10.0.0.4", 0));
        assert!(created);
        assert_eq!(k3.index, 1);
    }

    #[test]
    fn test_addr_stable_identity_under_reobservation() {
        let mut store = NetStore::new();
        let (first, created) = store.upsert_addr(addr(3, "10.0.0.1", 0));
        assert!(created);

        // Same (family, local) with different flags: same index, updated.
        let (second, created) = store.upsert_addr(addr(3, "10.0.0.1", 0x80));
        assert!(!created);
        assert_eq!(first, second);
        assert_eq!(store.get_addr(first).unwrap().flags, 0x80);
    }

    #[test]
    fn test_addr_indices_are_link_scoped() {
        let mut store = NetStore::new();
        let (a, _) = store.upsert_addr(addr(3, "10.0.0.1", 0));
        let (b, _) = store.upsert_addr(addr(4, "10.0.1.1", 0));
        assert_eq!(a.index, 0);
        assert_eq!(b.index, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_idempotent_delete_all_kinds() {
        let mut store = NetStore::new();
        let (lk, _) = store.upsert_link(link(3, "eth0"));
        let (ak, _) = store.upsert_addr(addr(3, "10.0.0.1", 0));
        let (nk, _) = store.upsert_neigh(neigh(3, "10.0.0.9", NudState::Reachable));
        let (rk, _) = store.upsert_route(route(254, "10.1.0.0/16", 3));

        store.remove_addr(ak);
        store.remove_addr(ak);
        store.remove_neigh(nk);
        store.remove_neigh(nk);
        store.remove_route(rk);
        store.remove_route(rk);
        store.remove_link(lk);
        store.remove_link(lk);

        assert_eq!(store.entry_count(), 0);
        assert_eq!(store.stats().remove_misses, 4);
    }

    #[test]
    fn test_route_identity_and_table_scoping() {
        let mut store = NetStore::new();
        let (a, created) = store.upsert_route(route(254, "10.1.0.0/16", 3));
        assert!(created);

        // Same identity, different metric: in-place update.
        let mut updated = route(254, "10.1.0.0/16", 3);
        updated.metric = 50;
        let (b, created) = store.upsert_route(updated);
        assert!(!created);
        assert_eq!(a, b);
        assert_eq!(store.get_route(a).unwrap().metric, 50);

        // Same destination in another table is a different route.
        let (c, created) = store.upsert_route(route(100, "10.1.0.0/16", 3));
        assert!(created);
        assert_ne!(a, c);
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let store = NetStore::new();
        assert_eq!(store.get_link(9), Err(StoreError::LinkNotFound(9)));
        let key = LinkScopedKey::new(9, 0);
        assert_eq!(store.get_addr(key), Err(StoreError::AddrNotFound(key)));
        assert_eq!(store.get_neigh(key), Err(StoreError::NeighNotFound(key)));
        let rkey = RouteKey::new(254, 0);
        assert_eq!(store.get_route(rkey), Err(StoreError::RouteNotFound(rkey)));
    }

    #[test]
    fn test_remove_link_drops_owned_tables() {
        let mut store = NetStore::new();
        store.upsert_link(link(3, "eth0"));
        store.upsert_addr(addr(3, "10.0.0.1", 0));
        store.upsert_neigh(neigh(3, "10.0.0.9", NudState::Stale));

        store.remove_link(3);
        assert_eq!(store.entry_count(), 0);
    }

    #[test]
    fn test_injected_route_lookup() {
        let mut store = NetStore::new();
        let mut injected = route(254, "10.9.0.0/16", 3);
        injected.origin = RouteOrigin::Injected;
        let (key, _) = store.upsert_route(injected);

        let dst = "10.9.0.0/16".parse().unwrap();
        assert_eq!(store.find_injected_route(254, dst), Some(key));

        // Kernel-origin routes are not withdrawable.
        store.upsert_route(route(254, "10.8.0.0/16", 3));
        assert_eq!(
            store.find_injected_route(254, "10.8.0.0/16".parse().unwrap()),
            None
        );
    }

    #[test]
    fn test_snapshot_counts() {
        let mut store = NetStore::new();
        store.upsert_link(link(3, "eth0"));
        store.upsert_addr(addr(3, "10.0.0.1", 0));
        store.upsert_route(route(254, "10.1.0.0/16", 3));

        let snap = store.snapshot();
        assert_eq!(snap.links.len(), 1);
        assert_eq!(snap.addrs.len(), 1);
        assert_eq!(snap.neighs.len(), 0);
        assert_eq!(snap.routes.len(), 1);
    }
}
