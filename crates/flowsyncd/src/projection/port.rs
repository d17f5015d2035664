//! Link/port projector: tap ownership and per-port classifier rules.
//!
//! Each forwarding-element port owns one tap device named after the
//! port. Punted frames are written to the tap; frames the kernel emits
//! on the tap are read by a per-tap task and injected back into the
//! device pipeline. Kernel link events need no flow-rule side effect at
//! this layer (addresses, neighbors and routes anchored to the link
//! drive their own projections); only port-status events from the
//! device do.
//!
//! The spanning-tree collaborator gates rule issuance through
//! [`PortForwardState`]: a Forwarding port classifies into the L3
//! table, a Learning port punts everything, a Blocking port has no
//! classifier rule at all and falls through to the table-miss drop.

use super::{issue, port_cookie, PortMap, ProjectionStats};
use crate::config::{PRIORITY_PORT, TABLE_L3, TAP_REOPEN_INTERVAL};
use crate::pool::PacketPool;
use crate::tap::TapDevice;
use flowsync_dataplane::{
    DataplaneChannel, FlowAction, FlowMatch, FlowMod, FlowRule, PortStatus, PortStatusReason,
};
use flowsync_types::PortNo;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Spanning-tree forwarding state of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortForwardState {
    Forwarding,
    Blocking,
    Learning,
}

struct PortRecord {
    name: String,
    forward: PortForwardState,
    link_up: bool,
    tap: Option<Arc<TapDevice>>,
    reader: Option<JoinHandle<()>>,
    /// Tap open failed; retried on the fixed timer.
    tap_pending: bool,
}

impl PortRecord {
    fn close_tap(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.tap = None;
    }
}

pub struct PortProjector {
    channel: Arc<dyn DataplaneChannel>,
    pool: PacketPool,
    /// Frames read from taps, delivered to the event loop for
    /// packet-out injection.
    frame_tx: mpsc::UnboundedSender<(PortNo, Vec<u8>)>,
    ports: BTreeMap<PortNo, PortRecord>,
    installed: BTreeMap<PortNo, FlowRule>,
    stats: ProjectionStats,
}

impl PortProjector {
    pub fn new(
        channel: Arc<dyn DataplaneChannel>,
        pool: PacketPool,
        frame_tx: mpsc::UnboundedSender<(PortNo, Vec<u8>)>,
    ) -> Self {
        Self {
            channel,
            pool,
            frame_tx,
            ports: BTreeMap::new(),
            installed: BTreeMap::new(),
            stats: ProjectionStats::default(),
        }
    }

    /// Fixed interval at which pending tap opens are retried.
    pub const REOPEN_INTERVAL: std::time::Duration = TAP_REOPEN_INTERVAL;

    pub fn handle_port_status(&mut self, ports_map: &mut PortMap, status: &PortStatus) {
        match status.reason {
            PortStatusReason::Add => {
                info!(port = %status.port, name = %status.name, "port added");
                ports_map.insert(status.name.clone(), status.port);
                self.ports.insert(
                    status.port,
                    PortRecord {
                        name: status.name.clone(),
                        forward: PortForwardState::Forwarding,
                        link_up: true,
                        tap: None,
                        reader: None,
                        tap_pending: false,
                    },
                );
                self.open_tap(status.port);
                self.apply_rule(status.port);
            }
            PortStatusReason::Delete => {
                info!(port = %status.port, name = %status.name, "port removed");
                self.retract_rule(status.port);
                if let Some(mut record) = self.ports.remove(&status.port) {
                    record.close_tap();
                    ports_map.remove(&record.name);
                }
            }
            PortStatusReason::Up | PortStatusReason::Down => {
                let up = status.reason == PortStatusReason::Up;
                if let Some(record) = self.ports.get_mut(&status.port) {
                    record.link_up = up;
                    if let Some(tap) = &record.tap {
                        if let Err(e) = tap.set_up(up) {
                            warn!(port = %status.port, error = %e, "tap link state change failed");
                        }
                    }
                }
            }
        }
    }

    /// Spanning-tree gate; reissues the port's classifier rule for the
    /// new state.
    pub fn set_port_state(&mut self, port: PortNo, state: PortForwardState) {
        let Some(record) = self.ports.get_mut(&port) else {
            debug!(%port, "forward state for unknown port, ignoring");
            self.stats.miss();
            return;
        };
        record.forward = state;
        self.apply_rule(port);
    }

    /// Writes a punted frame to the port's tap.
    pub fn deliver_frame(&self, port: PortNo, frame: &[u8]) {
        let Some(tap) = self.ports.get(&port).and_then(|r| r.tap.as_ref()) else {
            debug!(%port, "punted frame for port without tap, dropping");
            return;
        };
        if let Err(e) = tap.send_frame(frame) {
            warn!(%port, error = %e, "tap write failed");
        }
    }

    /// Retries taps whose open previously failed. Driven by the event
    /// loop on [`Self::REOPEN_INTERVAL`].
    pub fn retry_pending_taps(&mut self) {
        let pending: Vec<PortNo> = self
            .ports
            .iter()
            .filter(|(_, r)| r.tap_pending)
            .map(|(port, _)| *port)
            .collect();
        for port in pending {
            self.open_tap(port);
        }
    }

    pub fn has_pending_taps(&self) -> bool {
        self.ports.values().any(|r| r.tap_pending)
    }

    /// Tears down every tap and drops attachment records without
    /// channel I/O; used when the channel leaves `Established`.
    pub fn detach_all(&mut self) {
        for record in self.ports.values_mut() {
            record.close_tap();
        }
        self.installed.clear();
    }

    /// Resync: recreate every tap and reinstall every classifier rule.
    pub fn resync(&mut self) {
        let all: Vec<PortNo> = self.ports.keys().copied().collect();
        for port in &all {
            if let Some(record) = self.ports.get_mut(port) {
                record.close_tap();
            }
            self.open_tap(*port);
            self.apply_rule(*port);
        }
    }

    pub fn installed_count(&self) -> usize {
        self.installed.len()
    }

    pub fn stats(&self) -> ProjectionStats {
        self.stats
    }

    fn desired_rule(&self, port: PortNo) -> Option<FlowRule> {
        let record = self.ports.get(&port)?;
        let actions = match record.forward {
            PortForwardState::Forwarding => vec![FlowAction::GotoTable { table: TABLE_L3 }],
            PortForwardState::Learning => vec![FlowAction::ToController],
            PortForwardState::Blocking => return None,
        };
        Some(FlowRule {
            table: crate::config::TABLE_CLASSIFIER,
            priority: PRIORITY_PORT,
            cookie: port_cookie(port),
            matches: FlowMatch::new().with_in_port(port),
            actions,
        })
    }

    fn apply_rule(&mut self, port: PortNo) {
        match self.desired_rule(port) {
            Some(rule) => {
                if let Some(old) = self.installed.get(&port) {
                    if *old == rule {
                        return;
                    }
                    let old = old.clone();
                    issue(&*self.channel, &FlowMod::delete_of(&old), &mut self.stats);
                    self.installed.remove(&port);
                }
                if issue(&*self.channel, &FlowMod::Add(rule.clone()), &mut self.stats) {
                    self.installed.insert(port, rule);
                }
            }
            None => self.retract_rule(port),
        }
    }

    fn retract_rule(&mut self, port: PortNo) {
        if let Some(rule) = self.installed.remove(&port) {
            issue(&*self.channel, &FlowMod::delete_of(&rule), &mut self.stats);
        }
    }

    fn open_tap(&mut self, port: PortNo) {
        let Some(record) = self.ports.get_mut(&port) else {
            return;
        };

        match TapDevice::open(&record.name) {
            Ok(tap) => {
                let tap = Arc::new(tap);
                if let Err(e) = tap.set_up(record.link_up) {
                    warn!(%port, error = %e, "tap link state set failed");
                }
                record.reader = Some(spawn_tap_reader(
                    Arc::clone(&tap),
                    port,
                    self.pool.clone(),
                    self.frame_tx.clone(),
                ));
                record.tap = Some(tap);
                record.tap_pending = false;
            }
            Err(e) => {
                // Not fatal: the device file may appear later.
                warn!(%port, name = %record.name, error = %e, "tap open failed, will retry");
                record.tap_pending = true;
            }
        }
    }
}

/// Reads frames off a tap and hands them to the event loop. Buffers
/// come from the shared pool; an exhausted pool drops the frame after a
/// short pause instead of blocking the read path.
fn spawn_tap_reader(
    tap: Arc<TapDevice>,
    port: PortNo,
    pool: PacketPool,
    frame_tx: mpsc::UnboundedSender<(PortNo, Vec<u8>)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let mut buf = match pool.acquire() {
                Ok(buf) => buf,
                Err(_) => {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    continue;
                }
            };
            buf.reset_for_read(pool.buffer_capacity());

            let len = match tap.recv_frame(&mut buf).await {
                Ok(0) => continue,
                Ok(len) => len,
                Err(e) => {
                    warn!(%port, error = %e, "tap read failed, stopping reader");
                    return;
                }
            };
            buf.truncate(len);

            if frame_tx.send((port, buf.to_vec())).is_err() {
                return;
            }
        }
    })
}
