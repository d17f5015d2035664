//! Address projector: one punt rule per connected prefix.
//!
//! Traffic destined to a prefix the host owns an address in is punted
//! to the controller, which writes it to the owning port's tap so the
//! kernel stack terminates it.

use super::{addr_cookie, issue, ProjectionStats};
use crate::config::{PRIORITY_ADDR_BASE, TABLE_L3};
use flowsync_dataplane::{DataplaneChannel, FlowAction, FlowMatch, FlowMod, FlowRule};
use flowsync_store::{LinkScopedKey, NetStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub struct AddrProjector {
    channel: Arc<dyn DataplaneChannel>,
    installed: BTreeMap<LinkScopedKey, FlowRule>,
    stats: ProjectionStats,
}

impl AddrProjector {
    pub fn new(channel: Arc<dyn DataplaneChannel>) -> Self {
        Self {
            channel,
            installed: BTreeMap::new(),
            stats: ProjectionStats::default(),
        }
    }

    fn desired_rule(&self, store: &NetStore, key: LinkScopedKey) -> Option<FlowRule> {
        let entry = store.get_addr(key).ok()?;
        let prefix = entry.prefix();
        Some(FlowRule {
            table: TABLE_L3,
            priority: PRIORITY_ADDR_BASE + 2 * u16::from(prefix.prefix_len()),
            cookie: addr_cookie(key),
            matches: FlowMatch::new().with_ip_dst(prefix),
            actions: vec![FlowAction::ToController],
        })
    }

    /// Brings the installed state for `key` in line with the store.
    /// A changed rule is strict-deleted and re-added; an unchanged rule
    /// issues nothing.
    pub fn install(&mut self, store: &NetStore, key: LinkScopedKey) {
        let Some(rule) = self.desired_rule(store, key) else {
            debug!(%key, "address not in store, skipping install");
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

    /// Retracts the rule for `key`, if one is installed.
    pub fn uninstall(&mut self, key: LinkScopedKey) {
        if let Some(rule) = self.installed.remove(&key) {
            issue(&*self.channel, &FlowMod::delete_of(&rule), &mut self.stats);
        }
    }

    /// Drops all attachment records without I/O; used when the channel
    /// leaves `Established` (the remote state is gone with it).
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
