//! flowsyncd: projects the host kernel's network topology onto a
//! remote forwarding element as flow rules.
//!
//! Pipeline: kernel netlink → [`flowsync_store::NetStore`] → store
//! events → [`projection`] → forwarding-element channel. Southbound
//! events (port status, packet-in) flow back into the projection layer
//! and the taps. The [`reconciler`] ties both directions together and
//! owns full resync on channel (re)establishment.

pub mod config;
pub mod daemon;
pub mod pool;
pub mod projection;
pub mod reconciler;
pub mod tap;

pub use config::DaemonConfig;
pub use daemon::Daemon;
pub use pool::{PacketPool, PoolError};
pub use projection::PortForwardState;
pub use reconciler::{Reconciler, BASELINE_RULE_COUNT};
