//! Kernel neighbor reachability (NUD) states.

use serde::{Deserialize, Serialize};

/// Kernel neighbor state (NUD_* values from linux/neighbour.h).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum NudState {
    /// Address resolution in progress.
    Incomplete = 0x01,
    /// Neighbor is reachable.
    Reachable = 0x02,
    /// Reachability information is stale.
    Stale = 0x04,
    /// Resolution delayed, waiting before probing.
    Delay = 0x08,
    /// Probe in progress.
    Probe = 0x10,
    /// Resolution failed.
    Failed = 0x20,
    /// No resolution protocol on this link.
    NoArp = 0x40,
    /// Permanent (administratively configured) entry.
    Permanent = 0x80,
    /// State not reported by the kernel.
    None = 0x00,
}

impl NudState {
    /// Maps a kernel NUD_* value.
    pub fn from_kernel(state: u16) -> Self {
        match state {
            0x01 => Self::Incomplete,
            0x02 => Self::Reachable,
            0x04 => Self::Stale,
            0x08 => Self::Delay,
            0x10 => Self::Probe,
            0x20 => Self::Failed,
            0x40 => Self::NoArp,
            0x80 => Self::Permanent,
            _ => Self::None,
        }
    }

    /// True if the neighbor's link-layer address is currently believed
    /// valid and flow rules rewriting to it may be installed.
    #[inline]
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            Self::Stale | Self::NoArp | Self::Reachable | Self::Permanent
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_kernel() {
        assert_eq!(NudState::from_kernel(0x02), NudState::Reachable);
        assert_eq!(NudState::from_kernel(0x80), NudState::Permanent);
        assert_eq!(NudState::from_kernel(0x3000), NudState::None);
    }

    #[test]
    fn test_usable_partition() {
        for state in [
            NudState::Stale,
            NudState::NoArp,
            NudState::Reachable,
            NudState::Permanent,
        ] {
            assert!(state.is_usable(), "{state:?} should be usable");
        }
        for state in [
            NudState::Incomplete,
            NudState::Delay,
            NudState::Probe,
            NudState::Failed,
            NudState::None,
        ] {
            assert!(!state.is_usable(), "{state:?} should not be usable");
        }
    }
}
