//! Channel state machine and the southbound I/O trait.

use crate::error::DataplaneResult;
use crate::flow::FlowMod;
use flowsync_types::{MacAddress, PortNo};
use serde::{Deserialize, Serialize};

/// Lifecycle of the single forwarding-element control connection.
///
/// `NoChannel → Open → Established → NoChannel`. Store mutation
/// continues in every state; only projection I/O is gated on
/// `Established`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    /// No device connected.
    #[default]
    NoChannel,
    /// Transport is up, handshake not yet complete.
    Open,
    /// Handshake complete; flow mods may be issued.
    Established,
}

impl ChannelState {
    pub fn is_established(&self) -> bool {
        matches!(self, ChannelState::Established)
    }
}

/// Why a port-status event was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortStatusReason {
    /// Port appeared on the device.
    Add,
    /// Port removed from the device.
    Delete,
    /// Link came up.
    Up,
    /// Link went down.
    Down,
}

/// A port-status notification from the forwarding element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatus {
    pub port: PortNo,
    pub name: String,
    pub hw_addr: MacAddress,
    pub reason: PortStatusReason,
}

/// Events flowing north from the channel into the reconciliation
/// controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SouthboundEvent {
    /// Channel reached `Established`.
    ChannelUp,
    /// Channel left `Established` (device gone or handshake lost).
    ChannelDown,
    PortStatus(PortStatus),
    /// A frame the device punted to the controller.
    PacketIn { port: PortNo, frame: Vec<u8> },
}

/// The southbound I/O surface used by the projection layer.
///
/// Implementations must be cheap to call and non-blocking: writes are
/// queued, and a full queue surfaces as `Congested` rather than
/// stalling the event loop.
pub trait DataplaneChannel: Send + Sync {
    /// Current channel state.
    fn state(&self) -> ChannelState;

    /// Queues a flow-table modification. Fails `ChannelUnavailable`
    /// unless `Established`, `Congested` when the write queue is full.
    fn send_flow(&self, flow: &FlowMod) -> DataplaneResult<()>;

    /// Asks the device to drop all flow-table state. Used at the start
    /// of every full resync so the device never has to be trusted to
    /// remember anything.
    fn purge_flows(&self) -> DataplaneResult<()>;

    /// Injects a frame into the device pipeline (packet-out).
    fn send_packet(&self, port: PortNo, frame: &[u8]) -> DataplaneResult<()>;

    /// Fences all previously queued work: the device must finish it
    /// before anything issued afterwards. Issued at the end of a full
    /// resync so the replayed state is known-applied.
    fn barrier(&self) -> DataplaneResult<()>;
}
