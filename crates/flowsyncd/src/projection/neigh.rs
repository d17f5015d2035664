//! Neighbor projector: host rules with MAC rewrite, driven by the
//! kernel's NUD state machine.
//!
//! Every neighbor event recomputes a target state from the NUD state
//! and performs the minimal install/uninstall needed to reach it:
//!
//! - `Incomplete`, `Delay`, `Probe`, `Failed` (and `None`): the
//!   link-layer address is not currently trusted, target `Retracted`.
//! - `Stale`, `NoArp`, `Reachable`, `Permanent`: target `Installed`
//!   with the neighbor's current link-layer address as rewrite target.

use super::{issue, neigh_cookie, PortMap, ProjectionStats};
use crate::config::{PRIORITY_NEIGH, TABLE_L3};
use flowsync_dataplane::{DataplaneChannel, FlowAction, FlowMatch, FlowMod, FlowRule};
use flowsync_store::{LinkScopedKey, NetStore};
use flowsync_types::IpPrefix;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Target flow state for a neighbor, derived from its NUD state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Installed,
    Retracted,
}

pub struct NeighProjector {
    channel: Arc<dyn DataplaneChannel>,
    installed: BTreeMap<LinkScopedKey, FlowRule>,
    stats: ProjectionStats,
}

impl NeighProjector {
    pub fn new(channel: Arc<dyn DataplaneChannel>) -> Self {
        Self {
            channel,
            installed: BTreeMap::new(),
            stats: ProjectionStats::default(),
        }
    }

    fn desired_rule(
        &self,
        store: &NetStore,
        ports: &PortMap,
        key: LinkScopedKey,
    ) -> Option<FlowRule> {
        let entry = store.get_neigh(key).ok()?;
        if entry.lladdr.is_zero() {
            return None;
        }
        let link = store.get_link(entry.ifindex).ok()?;
        let port = ports.port_for_link(store, entry.ifindex)?;

        Some(FlowRule {
            table: TABLE_L3,
            priority: PRIORITY_NEIGH,
            cookie: neigh_cookie(key),
            matches: FlowMatch::new().with_ip_dst(IpPrefix::host(entry.dst)),
            actions: vec![
                FlowAction::SetEthSrc { mac: link.lladdr },
                FlowAction::SetEthDst { mac: entry.lladdr },
                FlowAction::Output { port },
            ],
        })
    }

    /// Recomputes the target state for `key` and converges on it.
    pub fn reconcile(&mut self, store: &NetStore, ports: &PortMap, key: LinkScopedKey) {
        let target = match store.get_neigh(key) {
            Ok(entry) if entry.state.is_usable() => TargetState::Installed,
            Ok(_) => TargetState::Retracted,
            Err(_) => {
                debug!(%key, "neighbor not in store, skipping");
                self.stats.miss();
                return;
            }
        };

        match target {
            TargetState::Retracted => self.uninstall(key),
            TargetState::Installed => {
                let Some(rule) = self.desired_rule(store, ports, key) else {
                    debug!(%key, "cannot build neighbor rule yet, skipping");
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
        }
    }

    pub fn uninstall(&mut self, key: LinkScopedKey) {
        if let Some(rule) = self.installed.remove(&key) {
            issue(&*self.channel, &FlowMod::delete_of(&rule), &mut self.stats);
        }
    }

    /// Drops all attachment records without I/O.
    pub fn detach_all(&mut self) {
        self.installed.clear();
    }

    pub fn is_installed(&self, key: LinkScopedKey) -> bool {
        self.installed.contains_key(&key)
    }

    pub fn installed_count(&self) -> usize {
        self.installed.len()
    }

    pub fn stats(&self) -> ProjectionStats {
        self.stats
    }
}
