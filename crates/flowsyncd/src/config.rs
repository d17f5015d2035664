//! Daemon configuration and the flow-table layout constants.
//!
//! The pipeline has two tables. Table 0 classifies: reserved multicast
//! is punted, frames from forwarding ports continue into table 1,
//! everything else is dropped by the table miss. Table 1 holds the L3
//! state projected from the store; its miss punts to the controller so
//! unmatched traffic surfaces on the taps.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ingress classification table.
pub const TABLE_CLASSIFIER: u8 = 0;
/// L3 forwarding table fed by the projection layer.
pub const TABLE_L3: u8 = 1;

/// Reserved multicast punt (01:80:c2:00:00:00, bridge control frames).
pub const PRIORITY_RESERVED_MCAST: u16 = 10_000;
/// Per-port classifier rules installed while a port forwards.
pub const PRIORITY_PORT: u16 = 100;
/// Table-miss rules.
pub const PRIORITY_MISS: u16 = 0;

/// Neighbor host rules: always more specific than any prefix rule.
pub const PRIORITY_NEIGH: u16 = 40_000;
/// Address (connected prefix) rules: `base + 2 * prefix_len`.
pub const PRIORITY_ADDR_BASE: u16 = 2_000;
/// Route rules: `base + 2 * prefix_len`, so longer prefixes win.
pub const PRIORITY_ROUTE_BASE: u16 = 1_000;

/// Retry interval for tap devices that failed to open.
pub const TAP_REOPEN_INTERVAL: Duration = Duration::from_millis(500);

/// Runtime parameters of the daemon.
///
/// The externally meaningful surface is the southbound listen port and
/// log verbosity (a CLI concern); the rest are sized-in defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// TCP port the forwarding element connects to.
    pub listen_port: u16,
    /// Number of buffers in the packet pool.
    pub pool_buffers: usize,
    /// Capacity of each pool buffer; covers a full-size frame.
    pub pool_buffer_capacity: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_port: 6653,
            pool_buffers: 256,
            pool_buffer_capacity: 2048,
        }
    }
}
