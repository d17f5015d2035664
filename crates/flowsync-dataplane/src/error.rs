//! Dataplane error types.
//!
//! The taxonomy mirrors what the projection layer needs to decide
//! whether to skip, drop or escalate: channel-unavailable and congested
//! outcomes are recoverable by construction (the next full resync
//! repairs whatever was skipped), protocol and I/O errors discard the
//! single affected message or connection.

use crate::channel::ChannelState;
use thiserror::Error;

/// Error type for southbound operations.
#[derive(Debug, Error)]
pub enum DataplaneError {
    /// Projection I/O was attempted while the channel is not
    /// `Established`. The caller keeps its projection `Detached` and
    /// relies on the next resync.
    #[error("channel unavailable (state {state:?})")]
    ChannelUnavailable { state: ChannelState },

    /// The southbound write queue rejected the message. The operation
    /// is dropped, not retried; the drop is counted by the caller.
    #[error("southbound channel congested")]
    Congested,

    /// Malformed message to or from the device; the single message is
    /// discarded.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Transport-level failure; ends the current connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DataplaneError {
    pub fn unavailable(state: ChannelState) -> Self {
        DataplaneError::ChannelUnavailable { state }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        DataplaneError::Protocol {
            message: message.into(),
        }
    }

    /// True for outcomes the projection layer absorbs by skipping the
    /// single operation (repaired by resync).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DataplaneError::ChannelUnavailable { .. } | DataplaneError::Congested
        )
    }

    pub fn is_congested(&self) -> bool {
        matches!(self, DataplaneError::Congested)
    }
}

/// Result type for southbound operations.
pub type DataplaneResult<T> = Result<T, DataplaneError>;
