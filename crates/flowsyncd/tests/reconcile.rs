//! End-to-end reconciliation tests: kernel updates in, flow mods out,
//! with a recording channel standing in for the forwarding element.

use flowsync_dataplane::testing::RecordingChannel;
use flowsync_dataplane::{
    ChannelState, DataplaneChannel, FlowAction, FlowMod, PortStatus, PortStatusReason,
    SouthboundEvent,
};
use flowsync_netlink::{Ingest, NetAction, NetObject, NetUpdate};
use flowsync_store::{
    AddrEntry, LinkEntry, NeighEntry, NetStore, NextHop, RouteEntry, RouteOrigin,
};
use flowsync_types::{AddressFamily, MacAddress, NudState, PortNo};
use flowsyncd::{PacketPool, PortForwardState, Reconciler, BASELINE_RULE_COUNT};
use pretty_assertions::assert_eq;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

struct Harness {
    store: NetStore,
    ingest: Ingest,
    reconciler: Reconciler,
    channel: Arc<RecordingChannel>,
    // Keeps the tap frame channel open for the reconciler's lifetime.
    _frame_rx: mpsc::UnboundedReceiver<(PortNo, Vec<u8>)>,
}

impl Harness {
    fn new(established: bool) -> Self {
        let channel = Arc::new(if established {
            RecordingChannel::established()
        } else {
            RecordingChannel::new()
        });
        let pool = PacketPool::new(8, 256);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let reconciler = Reconciler::new(
            Arc::clone(&channel) as Arc<dyn DataplaneChannel>,
            pool,
            frame_tx,
        );
        Self {
            store: NetStore::new(),
            ingest: Ingest::new(),
            reconciler,
            channel,
            _frame_rx: frame_rx,
        }
    }

    fn apply(&mut self, action: NetAction, object: NetObject) {
        self.ingest.apply(
            &mut self.store,
            &mut self.reconciler,
            NetUpdate::new(action, object),
        );
    }

    /// Registers a forwarding-element port whose name matches a link.
    fn add_port(&mut self, port: u32, name: &str) {
        self.reconciler.handle_southbound(
            &self.store,
            SouthboundEvent::PortStatus(PortStatus {
                port: PortNo(port),
                name: name.into(),
                hw_addr: MacAddress::ZERO,
                reason: PortStatusReason::Add,
            }),
        );
    }

    fn channel_up(&mut self) {
        self.channel.set_state(ChannelState::Established);
        self.reconciler
            .handle_southbound(&self.store, SouthboundEvent::ChannelUp);
    }

    fn channel_down(&mut self) {
        self.channel.set_state(ChannelState::NoChannel);
        self.reconciler
            .handle_southbound(&self.store, SouthboundEvent::ChannelDown);
    }
}

fn link(ifindex: u32, name: &str) -> LinkEntry {
    LinkEntry {
        ifindex,
        name: name.into(),
        lladdr: MacAddress::new([0x02, 0, 0, 0, 0, ifindex as u8]),
        broadcast: MacAddress::BROADCAST,
        flags: 0x41,
        mtu: 1500,
        hw_type: 1,
    }
}

fn addr(ifindex: u32, local: &str, prefix_len: u8) -> AddrEntry {
    let local: IpAddr = local.parse().unwrap();
    AddrEntry {
        ifindex,
        family: AddressFamily::from(local),
        prefix_len,
        local,
        peer: None,
        broadcast: None,
        scope: 0,
        flags: 0,
    }
}

fn neigh(ifindex: u32, dst: &str, lladdr: MacAddress, state: NudState) -> NeighEntry {
    let dst: IpAddr = dst.parse().unwrap();
    NeighEntry {
        ifindex,
        family: AddressFamily::from(dst),
        dst,
        lladdr,
        state,
        flags: 0,
        kind: 0,
    }
}

fn route(table: u32, dst: &str, gateway: &str, oif: u32) -> RouteEntry {
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
            gateway: Some(gateway.parse().unwrap()),
            ifindex: oif,
        }],
        origin: RouteOrigin::Kernel,
    }
}

const GW_MAC: MacAddress = MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
const GW2_MAC: MacAddress = MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02]);

// ====================================================================
// Address projection
// ====================================================================

#[test]
fn test_address_new_installs_prefix_punt() {
    // Scenario: empty store, one IPv4 address arrives on link 3.
    let mut h = Harness::new(true);
    h.apply(NetAction::New, NetObject::Link(link(3, "fs3")));
    h.apply(NetAction::New, NetObject::Addr(addr(3, "10.0.0.1", 24)));

    let key = h.store.find_addr(3, "10.0.0.1".parse().unwrap()).unwrap();
    assert_eq!((key.ifindex, key.index), (3, 0));

    let adds = h.channel.adds();
    assert_eq!(adds.len(), 1);
    let FlowMod::Add(rule) = &adds[0] else {
        panic!("expected add");
    };
    assert_eq!(rule.matches.ip_dst, Some("10.0.0.0/24".parse().unwrap()));
    assert_eq!(rule.matches.eth_type, Some(0x0800));
}

#[test]
fn test_address_delete_uninstalls_before_removal() {
    let mut h = Harness::new(true);
    h.apply(NetAction::New, NetObject::Addr(addr(3, "10.0.0.1", 24)));
    let key = h.store.find_addr(3, "10.0.0.1".parse().unwrap()).unwrap();

    h.apply(NetAction::Del, NetObject::Addr(addr(3, "10.0.0.1", 24)));

    let flows = h.channel.flows();
    assert_eq!(flows.len(), 2);
    assert!(flows[0].is_add());
    assert!(matches!(flows[1], FlowMod::DeleteStrict { .. }));
    assert!(h.store.get_addr(key).is_err());
}

#[test]
fn test_reobservation_with_changed_flags_is_one_install() {
    let mut h = Harness::new(true);
    h.apply(NetAction::New, NetObject::Addr(addr(3, "10.0.0.1", 24)));
    let key = h.store.find_addr(3, "10.0.0.1".parse().unwrap()).unwrap();

    let mut flagged = addr(3, "10.0.0.1", 24);
    flagged.flags = 0x80;
    h.apply(NetAction::Change, NetObject::Addr(flagged));

    // Same index, and the unchanged rule was not reissued.
    assert_eq!(
        h.store.find_addr(3, "10.0.0.1".parse().unwrap()).unwrap(),
        key
    );
    assert_eq!(h.channel.adds().len(), 1);
}

// ====================================================================
// Neighbor state machine
// ====================================================================

#[tokio::test]
async fn test_incomplete_then_reachable_is_exactly_one_install() {
    let mut h = Harness::new(true);
    h.apply(NetAction::New, NetObject::Link(link(3, "fs3")));
    h.add_port(7, "fs3");
    h.channel.clear();

    h.apply(
        NetAction::New,
        NetObject::Neigh(neigh(3, "10.0.0.9", MacAddress::ZERO, NudState::Incomplete)),
    );
    assert_eq!(h.channel.adds().len(), 0);

    h.apply(
        NetAction::Change,
        NetObject::Neigh(neigh(3, "10.0.0.9", GW_MAC, NudState::Reachable)),
    );

    let adds = h.channel.adds();
    assert_eq!(adds.len(), 1);
    let FlowMod::Add(rule) = &adds[0] else {
        panic!("expected add");
    };
    assert!(rule
        .actions
        .contains(&FlowAction::SetEthDst { mac: GW_MAC }));
    assert_eq!(
        rule.matches.ip_dst,
        Some("10.0.0.9/32".parse().unwrap())
    );
}

#[tokio::test]
async fn test_nud_state_partition() {
    let retracted = [
        NudState::Incomplete,
        NudState::Delay,
        NudState::Probe,
        NudState::Failed,
    ];
    let installed = [
        NudState::Stale,
        NudState::NoArp,
        NudState::Reachable,
        NudState::Permanent,
    ];

    for state in retracted {
        let mut h = Harness::new(true);
        h.apply(NetAction::New, NetObject::Link(link(3, "fs3")));
        h.add_port(7, "fs3");
        h.channel.clear();

        h.apply(
            NetAction::New,
            NetObject::Neigh(neigh(3, "10.0.0.9", GW_MAC, state)),
        );
        assert_eq!(h.channel.adds().len(), 0, "state {state:?} must retract");
    }

    for state in installed {
        let mut h = Harness::new(true);
        h.apply(NetAction::New, NetObject::Link(link(3, "fs3")));
        h.add_port(7, "fs3");
        h.channel.clear();

        h.apply(
            NetAction::New,
            NetObject::Neigh(neigh(3, "10.0.0.9", GW_MAC, state)),
        );
        let adds = h.channel.adds();
        assert_eq!(adds.len(), 1, "state {state:?} must install");
        let FlowMod::Add(rule) = &adds[0] else {
            panic!("expected add");
        };
        assert!(
            rule.actions.contains(&FlowAction::SetEthDst { mac: GW_MAC }),
            "state {state:?} must rewrite to the current link-layer address"
        );
    }
}

#[tokio::test]
async fn test_reachable_to_failed_retracts() {
    let mut h = Harness::new(true);
    h.apply(NetAction::New, NetObject::Link(link(3, "fs3")));
    h.add_port(7, "fs3");
    h.channel.clear();

    h.apply(
        NetAction::New,
        NetObject::Neigh(neigh(3, "10.0.0.9", GW_MAC, NudState::Reachable)),
    );
    h.apply(
        NetAction::Change,
        NetObject::Neigh(neigh(3, "10.0.0.9", GW_MAC, NudState::Failed)),
    );

    let flows = h.channel.flows();
    assert_eq!(flows.len(), 2);
    assert!(flows[0].is_add());
    assert!(matches!(flows[1], FlowMod::DeleteStrict { .. }));
}

// ====================================================================
// Routes
// ====================================================================

#[tokio::test]
async fn test_route_installs_once_next_hop_resolves() {
    let mut h = Harness::new(true);
    h.apply(NetAction::New, NetObject::Link(link(3, "fs3")));
    h.add_port(7, "fs3");
    h.channel.clear();

    // Gateway not resolved yet: the route is skipped.
    h.apply(
        NetAction::New,
        NetObject::Route(route(254, "192.168.0.0/16", "10.0.0.9", 3)),
    );
    assert_eq!(h.channel.adds().len(), 0);

    // Resolving the gateway installs its host rule; replaying the
    // route then succeeds.
    h.apply(
        NetAction::New,
        NetObject::Neigh(neigh(3, "10.0.0.9", GW_MAC, NudState::Reachable)),
    );
    h.apply(
        NetAction::Change,
        NetObject::Route(route(254, "192.168.0.0/16", "10.0.0.9", 3)),
    );

    let adds = h.channel.adds();
    assert_eq!(adds.len(), 2);
    let FlowMod::Add(rule) = &adds[1] else {
        panic!("expected add");
    };
    assert_eq!(
        rule.matches.ip_dst,
        Some("192.168.0.0/16".parse().unwrap())
    );
    assert!(rule
        .actions
        .contains(&FlowAction::Output { port: PortNo(7) }));
}

#[tokio::test]
async fn test_route_falls_back_to_later_usable_next_hop() {
    let mut h = Harness::new(true);
    h.apply(NetAction::New, NetObject::Link(link(3, "fs3")));
    h.apply(NetAction::New, NetObject::Link(link(4, "fs4")));
    h.add_port(7, "fs3");
    h.add_port(8, "fs4");
    h.apply(
        NetAction::New,
        NetObject::Neigh(neigh(3, "10.0.0.9", GW_MAC, NudState::Failed)),
    );
    h.apply(
        NetAction::New,
        NetObject::Neigh(neigh(4, "10.0.1.9", GW2_MAC, NudState::Reachable)),
    );
    h.channel.clear();

    // Multipath route whose first hop is unresolved; the second hop
    // must carry it.
    let mut multipath = route(254, "192.168.0.0/16", "10.0.0.9", 3);
    multipath.nexthops.push(NextHop {
        weight: 1,
        gateway: Some("10.0.1.9".parse().unwrap()),
        ifindex: 4,
    });
    h.apply(NetAction::New, NetObject::Route(multipath));

    let adds = h.channel.adds();
    assert_eq!(adds.len(), 1);
    let FlowMod::Add(rule) = &adds[0] else {
        panic!("expected add");
    };
    assert!(rule
        .actions
        .contains(&FlowAction::Output { port: PortNo(8) }));
    assert!(rule
        .actions
        .contains(&FlowAction::SetEthDst { mac: GW2_MAC }));
}

#[tokio::test]
async fn test_injected_route_survives_kernel_delete() {
    let mut h = Harness::new(true);
    h.apply(NetAction::New, NetObject::Link(link(3, "fs3")));
    h.add_port(7, "fs3");
    h.apply(
        NetAction::New,
        NetObject::Neigh(neigh(3, "10.0.0.9", GW_MAC, NudState::Reachable)),
    );
    h.channel.clear();

    let injected = route(254, "172.16.0.0/12", "10.0.0.9", 3);
    let (reconciler, store) = (&mut h.reconciler, &mut h.store);
    reconciler.inject_route(store, injected);
    assert_eq!(h.channel.adds().len(), 1);

    // A kernel delete for the same identity must not withdraw it.
    h.apply(
        NetAction::Del,
        NetObject::Route(route(254, "172.16.0.0/12", "10.0.0.9", 3)),
    );
    assert_eq!(h.channel.flows().len(), 1);
    assert!(h
        .store
        .find_injected_route(254, "172.16.0.0/12".parse().unwrap())
        .is_some());

    // Explicit withdrawal does.
    let (reconciler, store) = (&mut h.reconciler, &mut h.store);
    reconciler.withdraw_route(store, 254, "172.16.0.0/12".parse().unwrap());
    let flows = h.channel.flows();
    assert_eq!(flows.len(), 2);
    assert!(matches!(flows[1], FlowMod::DeleteStrict { .. }));
    assert!(h
        .store
        .find_injected_route(254, "172.16.0.0/12".parse().unwrap())
        .is_none());
}

// ====================================================================
// Resync and channel lifecycle
// ====================================================================

#[tokio::test]
async fn test_full_resync_replays_every_entry_exactly_once() {
    // Entries accumulate while no channel is attached.
    let mut h = Harness::new(false);
    h.apply(NetAction::New, NetObject::Link(link(3, "fs3")));
    h.apply(NetAction::New, NetObject::Addr(addr(3, "10.0.0.1", 24)));
    h.apply(
        NetAction::New,
        NetObject::Neigh(neigh(3, "10.0.0.9", GW_MAC, NudState::Reachable)),
    );
    h.apply(
        NetAction::New,
        NetObject::Route(route(254, "192.168.0.0/16", "10.0.0.9", 3)),
    );
    assert_eq!(h.channel.flows().len(), 0);

    // Port registration also happens before attach; its rule is part
    // of the resync.
    h.add_port(7, "fs3");
    assert_eq!(h.channel.flows().len(), 0);

    h.channel_up();

    // Baseline + 1 port rule + addr + neigh + route, fenced by one
    // barrier once the replay is complete.
    assert_eq!(h.channel.purge_count(), 1);
    assert_eq!(h.channel.adds().len(), BASELINE_RULE_COUNT + 4);
    assert_eq!(h.channel.barrier_count(), 1);
}

#[tokio::test]
async fn test_reconnect_detaches_then_reinstalls() {
    let mut h = Harness::new(true);
    h.apply(NetAction::New, NetObject::Link(link(3, "fs3")));
    h.add_port(7, "fs3");
    h.apply(NetAction::New, NetObject::Addr(addr(3, "10.0.0.1", 24)));
    h.apply(
        NetAction::New,
        NetObject::Neigh(neigh(3, "10.0.0.9", GW_MAC, NudState::Reachable)),
    );

    let installed_before = h.channel.adds().len();
    h.channel.clear();

    // Losing the channel produces no I/O at all.
    h.channel_down();
    assert_eq!(h.channel.flows().len(), 0);
    assert_eq!(h.reconciler.installed_count(), 0);

    // Reattaching replays everything that was installed before, after
    // a purge and the baseline.
    h.channel_up();
    assert_eq!(h.channel.purge_count(), 1);
    assert_eq!(
        h.channel.adds().len(),
        BASELINE_RULE_COUNT + installed_before
    );
}

#[test]
fn test_detached_channel_skips_projection_io() {
    let mut h = Harness::new(false);
    h.apply(NetAction::New, NetObject::Addr(addr(3, "10.0.0.1", 24)));

    assert_eq!(h.channel.flows().len(), 0);
    assert_eq!(h.reconciler.addr_stats().skipped_unavailable, 1);
    // The store tracked it regardless; projection catches up at resync.
    assert_eq!(h.store.entry_count(), 1);
}

#[test]
fn test_congested_write_is_dropped_not_retried() {
    let mut h = Harness::new(true);
    h.channel.set_congested(true);
    h.apply(NetAction::New, NetObject::Addr(addr(3, "10.0.0.1", 24)));

    assert_eq!(h.channel.flows().len(), 0);
    assert_eq!(h.reconciler.addr_stats().dropped_congested, 1);

    // The next resync repairs the dropped install.
    h.channel.set_congested(false);
    h.channel_up();
    assert_eq!(h.channel.adds().len(), BASELINE_RULE_COUNT + 1);
}

// ====================================================================
// Port gating
// ====================================================================

#[tokio::test]
async fn test_port_forward_state_gates_classifier_rule() {
    let mut h = Harness::new(true);
    h.add_port(7, "fs3");

    // Forwarding port gets its classifier rule on add.
    assert_eq!(h.channel.adds().len(), 1);

    h.reconciler
        .set_port_state(PortNo(7), PortForwardState::Blocking);
    let flows = h.channel.flows();
    assert!(matches!(flows.last(), Some(FlowMod::DeleteStrict { .. })));

    h.reconciler
        .set_port_state(PortNo(7), PortForwardState::Learning);
    let adds = h.channel.adds();
    let FlowMod::Add(rule) = adds.last().unwrap() else {
        panic!("expected add");
    };
    assert_eq!(rule.actions, vec![FlowAction::ToController]);
}

#[tokio::test]
async fn test_link_delete_retracts_dependents_first() {
    let mut h = Harness::new(true);
    h.apply(NetAction::New, NetObject::Link(link(3, "fs3")));
    h.add_port(7, "fs3");
    h.apply(NetAction::New, NetObject::Addr(addr(3, "10.0.0.1", 24)));
    h.apply(
        NetAction::New,
        NetObject::Neigh(neigh(3, "10.0.0.9", GW_MAC, NudState::Reachable)),
    );
    h.channel.clear();

    h.apply(NetAction::Del, NetObject::Link(link(3, "fs3")));

    // Both dependent rules were strict-deleted, and the store is empty.
    let flows = h.channel.flows();
    assert_eq!(flows.len(), 2);
    assert!(flows
        .iter()
        .all(|f| matches!(f, FlowMod::DeleteStrict { .. })));
    assert_eq!(h.store.entry_count(), 0);
}
