//! IP prefix type (CIDR notation) with masking helpers.

use crate::{AddressFamily, ParseError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// An IP prefix such as `10.0.0.0/24` or `2001:db8::/32`.
///
/// The stored address is always masked to the prefix length, so two
/// prefixes constructed from different host addresses within the same
/// network compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpPrefix {
    address: IpAddr,
    prefix_len: u8,
}

impl IpPrefix {
    /// Creates a new prefix, masking the address.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix length is invalid for the address
    /// family (>32 for IPv4, >128 for IPv6).
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, ParseError> {
        let family = AddressFamily::from(address);
        if prefix_len > family.max_prefix_len() {
            return Err(ParseError::InvalidIpPrefix(format!(
                "{address}/{prefix_len}"
            )));
        }
        Ok(IpPrefix {
            address: mask_addr(address, prefix_len),
            prefix_len,
        })
    }

    /// A host prefix (/32 or /128) for a single address.
    pub fn host(address: IpAddr) -> Self {
        let prefix_len = AddressFamily::from(address).max_prefix_len();
        IpPrefix {
            address,
            prefix_len,
        }
    }

    pub const fn address(&self) -> IpAddr {
        self.address
    }

    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::from(self.address)
    }

    /// The netmask as an address (e.g. 255.255.255.0 for /24).
    pub fn netmask(&self) -> IpAddr {
        match self.address {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::from(mask_bits_v4(self.prefix_len))),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::from(mask_bits_v6(self.prefix_len))),
        }
    }

    /// True if `addr` falls within this prefix.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.address, addr) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                mask_addr(addr, self.prefix_len) == self.address
            }
            _ => false,
        }
    }

    pub fn is_host(&self) -> bool {
        self.prefix_len == self.family().max_prefix_len()
    }

    pub fn is_default(&self) -> bool {
        self.prefix_len == 0
    }
}

fn mask_bits_v4(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len))
    }
}

fn mask_bits_v6(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix_len))
    }
}

fn mask_addr(addr: IpAddr, prefix_len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask_bits_v4(prefix_len)))
        }
        IpAddr::V6(v6) => {
            IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask_bits_v6(prefix_len)))
        }
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, len_str) = s
            .rsplit_once('/')
            .ok_or_else(|| ParseError::InvalidIpPrefix(s.to_string()))?;

        let address: IpAddr = addr_str
            .parse()
            .map_err(|_| ParseError::InvalidIpAddress(addr_str.to_string()))?;
        let prefix_len: u8 = len_str
            .parse()
            .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;

        IpPrefix::new(address, prefix_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_and_mask() {
        let prefix: IpPrefix = "10.0.0.1/24".parse().unwrap();
        assert_eq!(prefix.to_string(), "10.0.0.0/24");
        assert_eq!(prefix.netmask().to_string(), "255.255.255.0");
    }

    #[test]
    fn test_equal_after_masking() {
        let a: IpPrefix = "10.0.0.1/24".parse().unwrap();
        let b: IpPrefix = "10.0.0.200/24".parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_contains() {
        let prefix: IpPrefix = "192.168.1.0/24".parse().unwrap();
        assert!(prefix.contains("192.168.1.77".parse().unwrap()));
        assert!(!prefix.contains("192.168.2.1".parse().unwrap()));
        assert!(!prefix.contains("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_ipv6_prefix() {
        let prefix: IpPrefix = "2001:db8::1/64".parse().unwrap();
        assert_eq!(prefix.to_string(), "2001:db8::/64");
        assert!(prefix.contains("2001:db8::42".parse().unwrap()));
    }

    #[test]
    fn test_invalid_length_rejected() {
        assert!("10.0.0.0/33".parse::<IpPrefix>().is_err());
        assert!("2001:db8::/129".parse::<IpPrefix>().is_err());
    }

    #[test]
    fn test_host_and_default() {
        assert!(IpPrefix::host("10.0.0.1".parse().unwrap()).is_host());
        assert!("0.0.0.0/0".parse::<IpPrefix>().unwrap().is_default());
    }
}
