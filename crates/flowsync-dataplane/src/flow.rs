//! Flow-rule model: the match/action vocabulary installed on the
//! forwarding element.

use flowsync_types::{IpPrefix, MacAddress, PortNo};
use serde::{Deserialize, Serialize};

/// Match fields of a flow rule.
///
/// Unset fields wildcard. Deletes are strict: a delete only removes the
/// rule whose match (and priority and table) is exactly equal, which is
/// why projections rebuild the same match for uninstall that they used
/// for install.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowMatch {
    pub in_port: Option<PortNo>,
    pub eth_type: Option<u16>,
    pub eth_dst: Option<MacAddress>,
    /// IPv4 or IPv6 destination, masked by its prefix length.
    pub ip_dst: Option<IpPrefix>,
}

impl FlowMatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_in_port(mut self, port: PortNo) -> Self {
        self.in_port = Some(port);
        self
    }

    pub fn with_eth_type(mut self, eth_type: u16) -> Self {
        self.eth_type = Some(eth_type);
        self
    }

    pub fn with_eth_dst(mut self, mac: MacAddress) -> Self {
        self.eth_dst = Some(mac);
        self
    }

    /// Sets the IP destination match and the Ethernet type implied by
    /// its address family.
    pub fn with_ip_dst(mut self, prefix: IpPrefix) -> Self {
        self.eth_type = Some(prefix.family().eth_type());
        self.ip_dst = Some(prefix);
        self
    }
}

/// A single action of a flow rule, applied in list order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FlowAction {
    /// Emit on the given forwarding-element port.
    Output { port: PortNo },
    /// Rewrite the Ethernet source address.
    SetEthSrc { mac: MacAddress },
    /// Rewrite the Ethernet destination address.
    SetEthDst { mac: MacAddress },
    /// Continue processing in another table.
    GotoTable { table: u8 },
    /// Punt to the controller (packet-in).
    ToController,
    /// Flood out all ports except the ingress port.
    Flood,
}

/// A complete flow rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRule {
    pub table: u8,
    pub priority: u16,
    /// Opaque correlation handle chosen by the projection that owns the
    /// rule; echoed back by the device on errors and never interpreted.
    pub cookie: u64,
    #[serde(rename = "match")]
    pub matches: FlowMatch,
    pub actions: Vec<FlowAction>,
}

/// A flow-table modification issued southbound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FlowMod {
    Add(FlowRule),
    /// Strict delete: table, priority and match must be exactly equal.
    DeleteStrict {
        table: u8,
        priority: u16,
        #[serde(rename = "match")]
        matches: FlowMatch,
    },
}

impl FlowMod {
    /// Strict delete of a previously added rule.
    pub fn delete_of(rule: &FlowRule) -> Self {
        FlowMod::DeleteStrict {
            table: rule.table,
            priority: rule.priority,
            matches: rule.matches.clone(),
        }
    }

    pub fn is_add(&self) -> bool {
        matches!(self, FlowMod::Add(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ip_dst_implies_eth_type() {
        let v4 = FlowMatch::new().with_ip_dst("10.0.0.0/24".parse().unwrap());
        assert_eq!(v4.eth_type, Some(0x0800));

        let v6 = FlowMatch::new().with_ip_dst("2001:db8::/64".parse().unwrap());
        assert_eq!(v6.eth_type, Some(0x86dd));
    }

    #[test]
    fn test_delete_of_reuses_match() {
        let rule = FlowRule {
            table: 1,
            priority: 100,
            cookie: 42,
            matches: FlowMatch::new().with_ip_dst("10.0.0.0/24".parse().unwrap()),
            actions: vec![FlowAction::Output { port: PortNo(3) }],
        };

        match FlowMod::delete_of(&rule) {
            FlowMod::DeleteStrict {
                table,
                priority,
                matches,
            } => {
                assert_eq!(table, 1);
                assert_eq!(priority, 100);
                assert_eq!(matches, rule.matches);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_flow_mod_serialization_roundtrip() {
        let mod_ = FlowMod::Add(FlowRule {
            table: 0,
            priority: 10,
            cookie: 7,
            matches: FlowMatch::new().with_eth_type(0x0800),
            actions: vec![FlowAction::GotoTable { table: 1 }],
        });

        let json = serde_json::to_string(&mod_).unwrap();
        let back: FlowMod = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mod_);
    }
}
