//! Test double for the southbound channel.

use crate::channel::{ChannelState, DataplaneChannel};
use crate::error::{DataplaneError, DataplaneResult};
use crate::flow::FlowMod;
use flowsync_types::PortNo;
use parking_lot::Mutex;

/// In-memory [`DataplaneChannel`] that records everything sent through
/// it. The channel state is settable so tests can exercise detached and
/// congested paths.
#[derive(Default)]
pub struct RecordingChannel {
    state: Mutex<ChannelState>,
    congested: Mutex<bool>,
    flows: Mutex<Vec<FlowMod>>,
    purges: Mutex<u64>,
    barriers: Mutex<u64>,
    packets: Mutex<Vec<(PortNo, Vec<u8>)>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// A channel that starts out `Established`.
    pub fn established() -> Self {
        let channel = Self::default();
        channel.set_state(ChannelState::Established);
        channel
    }

    pub fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
    }

    /// When set, every send fails `Congested`.
    pub fn set_congested(&self, congested: bool) {
        *self.congested.lock() = congested;
    }

    pub fn flows(&self) -> Vec<FlowMod> {
        self.flows.lock().clone()
    }

    pub fn adds(&self) -> Vec<FlowMod> {
        self.flows.lock().iter().filter(|m| m.is_add()).cloned().collect()
    }

    pub fn purge_count(&self) -> u64 {
        *self.purges.lock()
    }

    pub fn barrier_count(&self) -> u64 {
        *self.barriers.lock()
    }

    pub fn packets(&self) -> Vec<(PortNo, Vec<u8>)> {
        self.packets.lock().clone()
    }

    pub fn clear(&self) {
        self.flows.lock().clear();
        *self.purges.lock() = 0;
        *self.barriers.lock() = 0;
        self.packets.lock().clear();
    }

    fn gate(&self) -> DataplaneResult<()> {
        let state = *self.state.lock();
        if !state.is_established() {
            return Err(DataplaneError::unavailable(state));
        }
        if *self.congested.lock() {
            return Err(DataplaneError::Congested);
        }
        Ok(())
    }
}

impl DataplaneChannel for RecordingChannel {
    fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    fn send_flow(&self, flow: &FlowMod) -> DataplaneResult<()> {
        self.gate()?;
        self.flows.lock().push(flow.clone());
        Ok(())
    }

    fn purge_flows(&self) -> DataplaneResult<()> {
        self.gate()?;
        *self.purges.lock() += 1;
        Ok(())
    }

    fn send_packet(&self, port: PortNo, frame: &[u8]) -> DataplaneResult<()> {
        self.gate()?;
        self.packets.lock().push((port, frame.to_vec()));
        Ok(())
    }

    fn barrier(&self) -> DataplaneResult<()> {
        self.gate()?;
        *self.barriers.lock() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowMatch, FlowRule};

    fn any_flow() -> FlowMod {
        FlowMod::Add(FlowRule {
            table: 0,
            priority: 1,
            cookie: 0,
            matches: FlowMatch::new(),
            actions: vec![],
        })
    }

    #[test]
    fn test_records_when_established() {
        let channel = RecordingChannel::established();
        channel.send_flow(&any_flow()).unwrap();
        channel.purge_flows().unwrap();
        channel.barrier().unwrap();
        assert_eq!(channel.flows().len(), 1);
        assert_eq!(channel.purge_count(), 1);
        assert_eq!(channel.barrier_count(), 1);

        channel.clear();
        assert_eq!(channel.barrier_count(), 0);
    }

    #[test]
    fn test_rejects_when_detached() {
        let channel = RecordingChannel::new();
        let err = channel.send_flow(&any_flow()).unwrap_err();
        assert!(matches!(err, DataplaneError::ChannelUnavailable { .. }));
        assert!(channel.flows().is_empty());
    }

    #[test]
    fn test_congestion_drops_send() {
        let channel = RecordingChannel::established();
        channel.set_congested(true);
        assert!(channel.send_flow(&any_flow()).unwrap_err().is_congested());
        assert!(channel.flows().is_empty());
    }
}
