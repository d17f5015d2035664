//! Kernel netlink event source for the flowsync engine.
//!
//! Three layers, separated so the reconciliation semantics are testable
//! without a kernel:
//!
//! - [`socket`]: the rtnetlink socket (Linux) or a mock, decoding raw
//!   messages into normalized updates
//! - [`update`]: the normalized update vocabulary
//! - [`ingest`]: applies updates to a [`flowsync_store::NetStore`] and
//!   fans typed store events out to subscribers

pub mod ingest;
pub mod socket;
pub mod update;

pub use ingest::{Ingest, IngestStats};
pub use socket::{AsyncNetlinkSocket, Batch, DumpKind, NetlinkSocket};
pub use update::{NetAction, NetObject, NetUpdate};

pub mod error {
    use thiserror::Error;

    /// Errors from the netlink socket layer.
    ///
    /// Decode failures never abort the event loop; the affected message
    /// is discarded and counted by the caller.
    #[derive(Debug, Error)]
    pub enum NetlinkError {
        #[error("netlink socket error: {0}")]
        Socket(String),

        #[error("netlink decode error: {0}")]
        Decode(String),
    }

    impl NetlinkError {
        pub fn socket(msg: impl Into<String>) -> Self {
            NetlinkError::Socket(msg.into())
        }

        pub fn decode(msg: impl Into<String>) -> Self {
            NetlinkError::Decode(msg.into())
        }
    }

    /// Result type for netlink operations.
    pub type Result<T> = std::result::Result<T, NetlinkError>;
}

pub use error::{NetlinkError, Result};
