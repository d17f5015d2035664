//! Common types for the flowsync control plane.
//!
//! This crate provides type-safe representations of the network primitives
//! shared by the store, the netlink event source and the projection layer:
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses
//! - [`IpPrefix`]: IP network prefixes (CIDR notation)
//! - [`NudState`]: kernel neighbor reachability (NUD) states
//! - [`PortNo`]: forwarding-element port numbers

mod mac;
mod nud;
mod prefix;

pub use mac::MacAddress;
pub use nud::NudState;
pub use prefix::IpPrefix;

use serde::{Deserialize, Serialize};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),
}

/// A forwarding-element port number.
///
/// Port numbers are assigned by the remote device and reported via
/// port-status events; they are distinct from kernel interface indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortNo(pub u32);

impl PortNo {
    /// Reserved "local" port: frames sent here terminate on the controller.
    pub const LOCAL: Self = PortNo(0xffff_fffe);

    pub const fn index(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for PortNo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "port{}", self.0)
    }
}

/// Address family, as carried in kernel messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// Maps a kernel AF_* value; returns `None` for families this engine
    /// does not track.
    pub fn from_kernel(family: u8) -> Option<Self> {
        match i32::from(family) {
            2 => Some(AddressFamily::Ipv4),  // AF_INET
            10 => Some(AddressFamily::Ipv6), // AF_INET6
            _ => None,
        }
    }

    /// The Ethernet type value matching this family.
    pub const fn eth_type(&self) -> u16 {
        match self {
            AddressFamily::Ipv4 => 0x0800,
            AddressFamily::Ipv6 => 0x86dd,
        }
    }

    /// Maximum prefix length for this family.
    pub const fn max_prefix_len(&self) -> u8 {
        match self {
            AddressFamily::Ipv4 => 32,
            AddressFamily::Ipv6 => 128,
        }
    }
}

impl From<std::net::IpAddr> for AddressFamily {
    fn from(addr: std::net::IpAddr) -> Self {
        match addr {
            std::net::IpAddr::V4(_) => AddressFamily::Ipv4,
            std::net::IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }
}
