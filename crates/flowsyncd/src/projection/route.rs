//! Route projector: prefix rules with next-hop MAC rewrite.
//!
//! Priority scales with prefix length so longer prefixes win. A route
//! is only installable once its next-hop resolves: the gateway must
//! have a usable neighbor entry on the outgoing link and the link must
//! map to a forwarding-element port. Unresolvable routes are skipped
//! (and picked up when a later neighbor or port event replays them).
//! Directly connected routes carry no gateway and are covered by the
//! address projector instead.

use super::{issue, route_cookie, PortMap, ProjectionStats};
use crate::config::{PRIORITY_ROUTE_BASE, TABLE_L3};
use flowsync_dataplane::{DataplaneChannel, FlowAction, FlowMatch, FlowMod, FlowRule};
use flowsync_store::{NetStore, RouteKey};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub struct RouteProjector {
    channel: Arc<dyn DataplaneChannel>,
    installed: BTreeMap<RouteKey, FlowRule>,
    stats: ProjectionStats,
}

impl RouteProjector {
    pub fn new(channel: Arc<dyn DataplaneChannel>) -> Self {
        Self {
            channel,
            installed: BTreeMap::new(),
            stats: ProjectionStats::default(),
        }
    }

    fn desired_rule(&self, store: &NetStore, ports: &PortMap, key: RouteKey) -> Option<FlowRule> {
        let entry = store.get_route(key).ok()?;

        // First next-hop with a usable neighbor wins; later hops are
        // tried when an earlier one is unresolved. ECMP is not spread
        // across hops at the flow level.
        let (oif, next_mac) = entry.nexthops.iter().find_map(|hop| {
            let gateway = hop.gateway?;
            let neigh_key = store.find_neigh(hop.ifindex, gateway)?;
            let neigh = store.get_neigh(neigh_key).ok()?;
            if !neigh.state.is_usable() || neigh.lladdr.is_zero() {
                return None;
            }
            Some((hop.ifindex, neigh.lladdr))
        })?;

        let link = store.get_link(oif).ok()?;
        let port = ports.port_for_link(store, oif)?;

        Some(FlowRule {
            table: TABLE_L3,
            priority: PRIORITY_ROUTE_BASE + 2 * u16::from(entry.dst.prefix_len()),
            cookie: route_cookie(key),
            matches: FlowMatch::new().with_ip_dst(entry.dst),
            actions: vec![
                FlowAction::SetEthSrc { mac: link.lladdr },
                FlowAction::SetEthDst { mac: next_mac },
                FlowAction::Output { port },
            ],
        })
    }

    /// Brings the installed state for `key` in line with the store.
    pub fn install(&mut self, store: &NetStore, ports: &PortMap, key: RouteKey) {
        let Some(rule) = self.desired_rule(store, ports, key) else {
            debug!(%key, "route not installable, skipping");
            self.stats.miss();
            return;
        };

        if let Some(old) = self.installed.get(&key) {
            if *old == rule {
                return;
            }
            let old = old.clone();
            issue(&*self.channel, &FlowMod::delete_of(&old), &mut self.stats);
            self.installed.remove(&key);
        }

        if issue(&*self.channel, &FlowMod::Add(rule.clone()), &mut self.stats) {
            self.installed.insert(key, rule);
        }
    }

    pub fn uninstall(&mut self, key: RouteKey) {
        if let Some(rule) = self.installed.remove(&key) {
            issue(&*self.channel, &FlowMod::delete_of(&rule), &mut self.stats);
        }
    }

    /// Drops all attachment records without I/O.
    pub fn detach_all(&mut self) {
        self.installed.clear();
    }

    pub fn is_installed(&self, key: RouteKey) -> bool {
        self.installed.contains_key(&key)
    }

    pub fn installed_count(&self) -> usize {
        self.installed.len()
    }

    pub fn stats(&self) -> ProjectionStats {
        self.stats
    }
}
