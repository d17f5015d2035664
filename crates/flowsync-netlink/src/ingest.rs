//! Store ingest: applies normalized kernel updates and announces them.
//!
//! Ordering contract, relied on by the projection layer:
//!
//! - Creates and updates mutate the store first, then notify, so a sink
//!   reading back through the event's key sees the new state.
//! - Deletes notify first, then remove, so a sink can read the dying
//!   entry one last time to build its uninstall. A link delete announces
//!   the link's neighbors and addresses before the link itself, since
//!   removing the link drops its owned tables.
//!
//! Deletes for objects the store never saw are silent no-ops (the kernel
//! replays deletions across dump overlaps); they are counted, not
//! errored.

use crate::update::{NetAction, NetObject, NetUpdate};
use flowsync_store::{EventSink, NetStore, RouteOrigin, StoreEvent};
use tracing::{debug, trace};

/// Saturating counters for the ingest path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub applied: u64,
    /// Deletes for entries the store never held.
    pub delete_misses: u64,
    /// Kernel route deletions ignored because the matching store entry
    /// was injected by a snooper, not learned from the kernel.
    pub injected_route_guards: u64,
}

/// Applies [`NetUpdate`]s to a store and fans the resulting store events
/// out to a sink.
#[derive(Debug, Default)]
pub struct Ingest {
    stats: IngestStats,
}

impl Ingest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Applies one update. Infallible: unknown deletions and unparseable
    /// corners are absorbed here, never surfaced to the event loop.
    pub fn apply(&mut self, store: &mut NetStore, sink: &mut dyn EventSink, update: NetUpdate) {
        trace!(action = ?update.action, kind = update.object.kind(), "ingest");
        match (update.action, update.object) {
            (NetAction::New | NetAction::Change, NetObject::Link(link)) => {
                let (ifindex, created) = store.upsert_link(link);
                let event = if created {
                    StoreEvent::LinkCreated(ifindex)
                } else {
                    StoreEvent::LinkUpdated(ifindex)
                };
                self.applied(store, sink, event);
            }
            (NetAction::Del, NetObject::Link(link)) => self.delete_link(store, sink, link.ifindex),
            (NetAction::New | NetAction::Change, NetObject::Addr(addr)) => {
                let (key, created) = store.upsert_addr(addr);
                let event = if created {
                    StoreEvent::AddrCreated(key)
                } else {
                    StoreEvent::AddrUpdated(key)
                };
                self.applied(store, sink, event);
            }
            (NetAction::Del, NetObject::Addr(addr)) => {
                match store.find_addr(addr.ifindex, addr.local) {
                    Some(key) => {
                        sink.on_store_event(store, StoreEvent::AddrDeleted(key));
                        store.remove_addr(key);
                        self.stats.applied = self.stats.applied.saturating_add(1);
                    }
                    None => self.miss("addr"),
                }
            }
            (NetAction::New | NetAction::Change, NetObject::Neigh(neigh)) => {
                // A state change for a neighbor observed for the first
                // time creates it; the kernel does not replay the birth.
                let (key, created) = store.upsert_neigh(neigh);
                let event = if created {
                    StoreEvent::NeighCreated(key)
                } else {
                    StoreEvent::NeighUpdated(key)
                };
                self.applied(store, sink, event);
            }
            (NetAction::Del, NetObject::Neigh(neigh)) => {
                match store.find_neigh(neigh.ifindex, neigh.dst) {
                    Some(key) => {
                        sink.on_store_event(store, StoreEvent::NeighDeleted(key));
                        store.remove_neigh(key);
                        self.stats.applied = self.stats.applied.saturating_add(1);
                    }
                    None => self.miss("neigh"),
                }
            }
            (NetAction::New | NetAction::Change, NetObject::Route(route)) => {
                let (key, created) = store.upsert_route(route);
                let event = if created {
                    StoreEvent::RouteCreated(key)
                } else {
                    StoreEvent::RouteUpdated(key)
                };
                self.applied(store, sink, event);
            }
            (NetAction::Del, NetObject::Route(route)) => match store.find_route(&route) {
                Some(key) => {
                    // Injected routes are owned by the snooper that put
                    // them there; the kernel cannot withdraw them.
                    let injected = store
                        .get_route(key)
                        .map(|e| e.origin == RouteOrigin::Injected)
                        .unwrap_or(false);
                    if injected {
                        debug!(%key, "ignoring kernel delete for injected route");
                        self.stats.injected_route_guards =
                            self.stats.injected_route_guards.saturating_add(1);
                        return;
                    }
                    sink.on_store_event(store, StoreEvent::RouteDeleted(key));
                    store.remove_route(key);
                    self.stats.applied = self.stats.applied.saturating_add(1);
                }
                None => self.miss("route"),
            },
        }
    }

    /// Link removal drops the link's address and neighbor tables, so
    /// those deletions are announced first, each while its entry is
    /// still readable.
    fn delete_link(&mut self, store: &mut NetStore, sink: &mut dyn EventSink, ifindex: u32) {
        if store.get_link(ifindex).is_err() {
            self.miss("link");
            return;
        }
        for key in store.neigh_keys_for_link(ifindex) {
            sink.on_store_event(store, StoreEvent::NeighDeleted(key));
        }
        for key in store.addr_keys_for_link(ifindex) {
            sink.on_store_event(store, StoreEvent::AddrDeleted(key));
        }
        sink.on_store_event(store, StoreEvent::LinkDeleted(ifindex));
        store.remove_link(ifindex);
        self.stats.applied = self.stats.applied.saturating_add(1);
    }

    fn applied(&mut self, store: &NetStore, sink: &mut dyn EventSink, event: StoreEvent) {
        self.stats.applied = self.stats.applied.saturating_add(1);
        sink.on_store_event(store, event);
    }

    fn miss(&mut self, kind: &'static str) {
        debug!(kind, "delete for unknown entry, ignoring");
        self.stats.delete_misses = self.stats.delete_misses.saturating_add(1);
    }
}
