//! Actions of a flow rule.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::item::FlowItem;

/// RSS hash function selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RssFunction {
    #[default]
    Default,
    Toeplitz,
    SimpleXor,
}

/// RSS spread over a queue range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RssConf {
    pub func: RssFunction,
    /// Encapsulation level to hash on; 0 is the outermost.
    pub level: u32,
    /// Hash types; 0 means the device's configured set.
    pub types: u64,
    pub queues: Vec<u16>,
}

/// Action type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    Void,
    Passthru,
    Jump,
    Mark,
    Flag,
    Queue,
    Drop,
    Count,
    Rss,
    PortId,
    VxlanDecap,
    VxlanEncap,
    PopVlan,
    PushVlan,
    SetVlanPcp,
    SetVlanVid,
    Meter,
    SetTtl,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionType::Void => "VOID",
            ActionType::Passthru => "PASSTHRU",
            ActionType::Jump => "JUMP",
            ActionType::Mark => "MARK",
            ActionType::Flag => "FLAG",
            ActionType::Queue => "QUEUE",
            ActionType::Drop => "DROP",
            ActionType::Count => "COUNT",
            ActionType::Rss => "RSS",
            ActionType::PortId => "PORT_ID",
            ActionType::VxlanDecap => "VXLAN_DECAP",
            ActionType::VxlanEncap => "VXLAN_ENCAP",
            ActionType::PopVlan => "OF_POP_VLAN",
            ActionType::PushVlan => "OF_PUSH_VLAN",
            ActionType::SetVlanPcp => "OF_SET_VLAN_PCP",
            ActionType::SetVlanVid => "OF_SET_VLAN_VID",
            ActionType::Meter => "METER",
            ActionType::SetTtl => "SET_TTL",
        };
        write!(f, "{}", s)
    }
}

/// One action of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowAction {
    Void,
    Passthru,
    Jump { group: u32 },
    Mark { id: u32 },
    Flag,
    Queue { index: u16 },
    Drop,
    Count,
    Rss(RssConf),
    /// Steer to a peer port's vNIC; `original` selects this port's own vNIC.
    PortId {
        #[serde(default)]
        original: bool,
        #[serde(default)]
        id: u16,
    },
    VxlanDecap,
    /// Encapsulate with the headers in `definition`:
    /// ETH [VLAN] IPV4|IPV6 UDP VXLAN.
    VxlanEncap { definition: Vec<FlowItem> },
    PopVlan,
    PushVlan { ether_type: u16 },
    SetVlanPcp { pcp: u8 },
    SetVlanVid { vid: u16 },
    Meter { id: u32 },
    SetTtl { ttl: u8 },
}

impl FlowAction {
    pub fn action_type(&self) -> ActionType {
        match self {
            FlowAction::Void => ActionType::Void,
            FlowAction::Passthru => ActionType::Passthru,
            FlowAction::Jump { .. } => ActionType::Jump,
            FlowAction::Mark { .. } => ActionType::Mark,
            FlowAction::Flag => ActionType::Flag,
            FlowAction::Queue { .. } => ActionType::Queue,
            FlowAction::Drop => ActionType::Drop,
            FlowAction::Count => ActionType::Count,
            FlowAction::Rss(_) => ActionType::Rss,
            FlowAction::PortId { .. } => ActionType::PortId,
            FlowAction::VxlanDecap => ActionType::VxlanDecap,
            FlowAction::VxlanEncap { .. } => ActionType::VxlanEncap,
            FlowAction::PopVlan => ActionType::PopVlan,
            FlowAction::PushVlan { .. } => ActionType::PushVlan,
            FlowAction::SetVlanPcp { .. } => ActionType::SetVlanPcp,
            FlowAction::SetVlanVid { .. } => ActionType::SetVlanVid,
            FlowAction::Meter { .. } => ActionType::Meter,
            FlowAction::SetTtl { .. } => ActionType::SetTtl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_action_json() {
        let actions: Vec<FlowAction> = serde_json::from_str(
            r#"[
                {"type": "count"},
                {"type": "jump", "group": 5},
                {"type": "rss", "queues": [0, 1, 2]},
                {"type": "port_id", "id": 3}
            ]"#,
        )
        .unwrap();
        assert_eq!(actions[0], FlowAction::Count);
        assert_eq!(actions[1], FlowAction::Jump { group: 5 });
        assert_eq!(
            actions[2],
            FlowAction::Rss(RssConf {
                queues: vec![0, 1, 2],
                ..RssConf::default()
            })
        );
        assert_eq!(
            actions[3],
            FlowAction::PortId {
                original: false,
                id: 3
            }
        );
        assert_eq!(actions[2].action_type().to_string(), "RSS");
    }
}
