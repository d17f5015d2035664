//! Reconciliation controller: routes store and southbound events into
//! the projection layer and owns full resync.
//!
//! Full resync is the engine's central correctness property: whenever
//! the channel reaches `Established`, the remote flow tables are purged
//! and rebuilt from the store alone, so the device is never trusted to
//! remember anything across a reconnect. Conversely, when the channel
//! drops, every projection is detached without I/O (the remote state is
//! gone with the connection) and the taps are torn down.

use crate::config::{PRIORITY_MISS, PRIORITY_RESERVED_MCAST, TABLE_CLASSIFIER, TABLE_L3};
use crate::pool::PacketPool;
use crate::projection::{
    baseline_cookie, issue, AddrProjector, NeighProjector, PortForwardState, PortMap,
    PortProjector, ProjectionStats, RouteProjector,
};
use flowsync_dataplane::{
    DataplaneChannel, FlowAction, FlowMatch, FlowMod, FlowRule, SouthboundEvent,
};
use flowsync_store::{EventSink, NetStore, RouteEntry, RouteOrigin, StoreEvent};
use flowsync_types::{IpPrefix, MacAddress, PortNo};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 01:80:c2:00:00:00, the bridge-reserved multicast block.
const RESERVED_MCAST: MacAddress = MacAddress::new([0x01, 0x80, 0xc2, 0x00, 0x00, 0x00]);

/// Rules installed at the start of every resync before any projection
/// replays: reserved-multicast punt, classifier miss (drop), L3 miss
/// (punt).
pub const BASELINE_RULE_COUNT: usize = 3;

pub struct Reconciler {
    channel: Arc<dyn DataplaneChannel>,
    ports: PortMap,
    addr: AddrProjector,
    neigh: NeighProjector,
    route: RouteProjector,
    port: PortProjector,
    baseline_stats: ProjectionStats,
    established: bool,
    resyncs: u64,
}

impl Reconciler {
    pub fn new(
        channel: Arc<dyn DataplaneChannel>,
        pool: PacketPool,
        frame_tx: mpsc::UnboundedSender<(PortNo, Vec<u8>)>,
    ) -> Self {
        Self {
            addr: AddrProjector::new(Arc::clone(&channel)),
            neigh: NeighProjector::new(Arc::clone(&channel)),
            route: RouteProjector::new(Arc::clone(&channel)),
            port: PortProjector::new(Arc::clone(&channel), pool, frame_tx),
            channel,
            ports: PortMap::default(),
            baseline_stats: ProjectionStats::default(),
            established: false,
            resyncs: 0,
        }
    }

    pub fn handle_southbound(&mut self, store: &NetStore, event: SouthboundEvent) {
        match event {
            SouthboundEvent::ChannelUp => self.on_channel_up(store),
            SouthboundEvent::ChannelDown => self.on_channel_down(),
            SouthboundEvent::PortStatus(status) => {
                self.port.handle_port_status(&mut self.ports, &status);
            }
            SouthboundEvent::PacketIn { port, frame } => {
                self.port.deliver_frame(port, &frame);
            }
        }
    }

    /// Full resync: purge, recreate taps, baseline rules, then replay
    /// every store entry through its projector.
    fn on_channel_up(&mut self, store: &NetStore) {
        self.established = true;
        self.resyncs = self.resyncs.saturating_add(1);
        info!(resync = self.resyncs, entries = store.entry_count(), "channel established, full resync");

        if let Err(e) = self.channel.purge_flows() {
            warn!(error = %e, "flow purge failed, replaying anyway");
        }

        // Projections were detached on channel loss; start clean even
        // if this is a first attach.
        self.addr.detach_all();
        self.neigh.detach_all();
        self.route.detach_all();

        self.port.resync();
        self.install_baseline();

        let addr_keys: Vec<_> = store.addrs().map(|(key, _)| key).collect();
        for key in addr_keys {
            self.addr.install(store, key);
        }
        let neigh_keys: Vec<_> = store.neighs().map(|(key, _)| key).collect();
        for key in neigh_keys {
            self.neigh.reconcile(store, &self.ports, key);
        }
        let route_keys: Vec<_> = store.routes().map(|(key, _)| key).collect();
        for key in route_keys {
            self.route.install(store, &self.ports, key);
        }

        // Fence the replayed state so later mods order behind it.
        if let Err(e) = self.channel.barrier() {
            warn!(error = %e, "post-resync barrier failed");
        }
    }

    /// The channel is gone: mark everything detached without further
    /// I/O and tear down the taps.
    fn on_channel_down(&mut self) {
        info!("channel lost, detaching all projections");
        self.established = false;
        self.addr.detach_all();
        self.neigh.detach_all();
        self.route.detach_all();
        self.port.detach_all();
    }

    fn install_baseline(&mut self) {
        let rules = [
            FlowRule {
                table: TABLE_CLASSIFIER,
                priority: PRIORITY_RESERVED_MCAST,
                cookie: baseline_cookie(0),
                matches: FlowMatch::new().with_eth_dst(RESERVED_MCAST),
                actions: vec![FlowAction::ToController],
            },
            // Classifier miss: drop frames from ports without a rule.
            FlowRule {
                table: TABLE_CLASSIFIER,
                priority: PRIORITY_MISS,
                cookie: baseline_cookie(1),
                matches: FlowMatch::new(),
                actions: vec![],
            },
            // L3 miss: punt unmatched traffic to the controller taps.
            FlowRule {
                table: TABLE_L3,
                priority: PRIORITY_MISS,
                cookie: baseline_cookie(2),
                matches: FlowMatch::new(),
                actions: vec![FlowAction::ToController],
            },
        ];
        for rule in rules {
            issue(
                &*self.channel,
                &FlowMod::Add(rule),
                &mut self.baseline_stats,
            );
        }
    }

    // ------------------------------------------------------------------
    // Collaborator surface
    // ------------------------------------------------------------------

    /// Route injection for protocol snoopers. Injected routes project
    /// like kernel routes but can only be withdrawn through
    /// [`Self::withdraw_route`], never by kernel delete notifications.
    pub fn inject_route(&mut self, store: &mut NetStore, mut route: RouteEntry) {
        route.origin = RouteOrigin::Injected;
        let (key, created) = store.upsert_route(route);
        debug!(%key, created, "route injected");
        let event = if created {
            StoreEvent::RouteCreated(key)
        } else {
            StoreEvent::RouteUpdated(key)
        };
        self.on_store_event(store, event);
    }

    /// Withdraws a previously injected route. Unknown routes are a
    /// no-op.
    pub fn withdraw_route(&mut self, store: &mut NetStore, table: u32, dst: IpPrefix) {
        let Some(key) = store.find_injected_route(table, dst) else {
            debug!(table, %dst, "withdraw for unknown injected route, ignoring");
            return;
        };
        self.on_store_event(store, StoreEvent::RouteDeleted(key));
        store.remove_route(key);
    }

    /// Spanning-tree gate for the port projector.
    pub fn set_port_state(&mut self, port: PortNo, state: PortForwardState) {
        self.port.set_port_state(port, state);
    }

    /// Drives pending tap reopens; called on the fixed retry timer.
    pub fn retry_pending_taps(&mut self) {
        self.port.retry_pending_taps();
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    pub fn resync_count(&self) -> u64 {
        self.resyncs
    }

    pub fn addr_stats(&self) -> ProjectionStats {
        self.addr.stats()
    }

    pub fn neigh_stats(&self) -> ProjectionStats {
        self.neigh.stats()
    }

    pub fn route_stats(&self) -> ProjectionStats {
        self.route.stats()
    }

    pub fn installed_count(&self) -> usize {
        self.addr.installed_count()
            + self.neigh.installed_count()
            + self.route.installed_count()
            + self.port.installed_count()
    }
}

impl EventSink for Reconciler {
    fn on_store_event(&mut self, store: &NetStore, event: StoreEvent) {
        match event {
            // Link events have no flow-rule side effect of their own;
            // dependents anchored to the link drive their projections
            // through their own events.
            StoreEvent::LinkCreated(ifindex) => debug!(ifindex, "link created"),
            StoreEvent::LinkUpdated(ifindex) => debug!(ifindex, "link updated"),
            StoreEvent::LinkDeleted(ifindex) => debug!(ifindex, "link deleted"),

            StoreEvent::AddrCreated(key) | StoreEvent::AddrUpdated(key) => {
                self.addr.install(store, key);
            }
            StoreEvent::AddrDeleted(key) => self.addr.uninstall(key),

            StoreEvent::NeighCreated(key) | StoreEvent::NeighUpdated(key) => {
                self.neigh.reconcile(store, &self.ports, key);
            }
            StoreEvent::NeighDeleted(key) => self.neigh.uninstall(key),

            StoreEvent::RouteCreated(key) | StoreEvent::RouteUpdated(key) => {
                self.route.install(store, &self.ports, key);
            }
            StoreEvent::RouteDeleted(key) => self.route.uninstall(key),
        }
    }
}
