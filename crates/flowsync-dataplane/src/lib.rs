//! Southbound boundary of the flowsync engine.
//!
//! This crate owns the vocabulary spoken toward the forwarding element —
//! flow matches, actions and flow mods — and the channel adapter that
//! carries them. There is exactly one attached forwarding element per
//! process; everything the projection layer issues goes through the
//! [`DataplaneChannel`] trait and is gated on the channel being
//! `Established`.
//!
//! # Modules
//!
//! - [`flow`]: flow-rule model (match, action, mod)
//! - [`channel`]: channel state machine and the `DataplaneChannel` trait
//! - [`server`]: TCP channel server for the real device connection
//! - [`testing`]: recording channel double for tests

pub mod channel;
pub mod error;
pub mod flow;
pub mod server;
pub mod testing;

pub use channel::{
    ChannelState, DataplaneChannel, PortStatus, PortStatusReason, SouthboundEvent,
};
pub use error::{DataplaneError, DataplaneResult};
pub use flow::{FlowAction, FlowMatch, FlowMod, FlowRule};
pub use server::{TcpChannel, WireMessage};
