//! Pattern items of a flow rule.
//!
//! A pattern is an ordered list of items describing the packet from the
//! outermost header inwards. Each item carries an optional spec (values to
//! match) and an optional mask (bits that matter). An item without a spec
//! only asserts that the header is present.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

/// Spec and mask of one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSpec<T> {
    #[serde(default)]
    pub spec: Option<T>,
    #[serde(default)]
    pub mask: Option<T>,
}

impl<T> ItemSpec<T> {
    /// Header present, any content.
    pub fn any() -> Self {
        Self {
            spec: None,
            mask: None,
        }
    }

    /// Match `spec` under the item's default mask.
    pub fn spec(spec: T) -> Self {
        Self {
            spec: Some(spec),
            mask: None,
        }
    }

    pub fn masked(spec: T, mask: T) -> Self {
        Self {
            spec: Some(spec),
            mask: Some(mask),
        }
    }
}

impl<T> Default for ItemSpec<T> {
    fn default() -> Self {
        Self::any()
    }
}

/// Headers with a mask applied when the rule gives a spec but no mask.
pub trait DefaultMask {
    fn default_mask() -> Self;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EthSpec {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub ether_type: u16,
}

impl DefaultMask for EthSpec {
    fn default_mask() -> Self {
        Self {
            dst: [0xff; 6],
            src: [0xff; 6],
            ether_type: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VlanSpec {
    pub tci: u16,
    pub inner_type: u16,
}

impl DefaultMask for VlanSpec {
    fn default_mask() -> Self {
        Self {
            tci: 0x0fff,
            inner_type: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ipv4Spec {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    pub tos: u8,
    pub ttl: u8,
}

impl Default for Ipv4Spec {
    fn default() -> Self {
        Self {
            src: Ipv4Addr::UNSPECIFIED,
            dst: Ipv4Addr::UNSPECIFIED,
            proto: 0,
            tos: 0,
            ttl: 0,
        }
    }
}

impl DefaultMask for Ipv4Spec {
    fn default_mask() -> Self {
        Self {
            src: Ipv4Addr::BROADCAST,
            dst: Ipv4Addr::BROADCAST,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ipv6Spec {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub proto: u8,
    pub hop_limits: u8,
    pub vtc_flow: u32,
}

impl Default for Ipv6Spec {
    fn default() -> Self {
        Self {
            src: Ipv6Addr::UNSPECIFIED,
            dst: Ipv6Addr::UNSPECIFIED,
            proto: 0,
            hop_limits: 0,
            vtc_flow: 0,
        }
    }
}

impl DefaultMask for Ipv6Spec {
    fn default_mask() -> Self {
        let all = Ipv6Addr::from(u128::MAX);
        Self {
            src: all,
            dst: all,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpSpec {
    pub src_port: u16,
    pub dst_port: u16,
}

impl DefaultMask for UdpSpec {
    fn default_mask() -> Self {
        Self {
            src_port: u16::MAX,
            dst_port: u16::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpSpec {
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: u8,
}

impl DefaultMask for TcpSpec {
    fn default_mask() -> Self {
        Self {
            src_port: u16::MAX,
            dst_port: u16::MAX,
            flags: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SctpSpec {
    pub src_port: u16,
    pub dst_port: u16,
    pub tag: u32,
}

impl DefaultMask for SctpSpec {
    fn default_mask() -> Self {
        Self {
            src_port: u16::MAX,
            dst_port: u16::MAX,
            tag: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VxlanSpec {
    pub flags: u8,
    pub vni: u32,
}

impl DefaultMask for VxlanSpec {
    fn default_mask() -> Self {
        Self {
            flags: 0,
            vni: 0x00ff_ffff,
        }
    }
}

/// Unparsed payload following the previous header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawSpec {
    pub relative: bool,
    pub search: bool,
    pub offset: i32,
    pub limit: u16,
    pub pattern: Vec<u8>,
}

/// Item type tags, usable as a dense index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemType {
    Void,
    Eth,
    Vlan,
    Ipv4,
    Ipv6,
    Udp,
    Tcp,
    Sctp,
    Vxlan,
    Raw,
    Icmp,
    Gre,
    Geneve,
    Mpls,
    Nvgre,
}

impl ItemType {
    pub const COUNT: usize = 15;

    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemType::Void => "VOID",
            ItemType::Eth => "ETH",
            ItemType::Vlan => "VLAN",
            ItemType::Ipv4 => "IPV4",
            ItemType::Ipv6 => "IPV6",
            ItemType::Udp => "UDP",
            ItemType::Tcp => "TCP",
            ItemType::Sctp => "SCTP",
            ItemType::Vxlan => "VXLAN",
            ItemType::Raw => "RAW",
            ItemType::Icmp => "ICMP",
            ItemType::Gre => "GRE",
            ItemType::Geneve => "GENEVE",
            ItemType::Mpls => "MPLS",
            ItemType::Nvgre => "NVGRE",
        };
        write!(f, "{}", s)
    }
}

/// One pattern item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowItem {
    Void,
    Eth(ItemSpec<EthSpec>),
    Vlan(ItemSpec<VlanSpec>),
    Ipv4(ItemSpec<Ipv4Spec>),
    Ipv6(ItemSpec<Ipv6Spec>),
    Udp(ItemSpec<UdpSpec>),
    Tcp(ItemSpec<TcpSpec>),
    Sctp(ItemSpec<SctpSpec>),
    Vxlan(ItemSpec<VxlanSpec>),
    Raw(ItemSpec<RawSpec>),
    Icmp,
    Gre,
    Geneve,
    Mpls,
    Nvgre,
}

impl FlowItem {
    pub fn item_type(&self) -> ItemType {
        match self {
            FlowItem::Void => ItemType::Void,
            FlowItem::Eth(_) => ItemType::Eth,
            FlowItem::Vlan(_) => ItemType::Vlan,
            FlowItem::Ipv4(_) => ItemType::Ipv4,
            FlowItem::Ipv6(_) => ItemType::Ipv6,
            FlowItem::Udp(_) => ItemType::Udp,
            FlowItem::Tcp(_) => ItemType::Tcp,
            FlowItem::Sctp(_) => ItemType::Sctp,
            FlowItem::Vxlan(_) => ItemType::Vxlan,
            FlowItem::Raw(_) => ItemType::Raw,
            FlowItem::Icmp => ItemType::Icmp,
            FlowItem::Gre => ItemType::Gre,
            FlowItem::Geneve => ItemType::Geneve,
            FlowItem::Mpls => ItemType::Mpls,
            FlowItem::Nvgre => ItemType::Nvgre,
        }
    }

    pub fn eth() -> Self {
        FlowItem::Eth(ItemSpec::any())
    }

    pub fn ipv4() -> Self {
        FlowItem::Ipv4(ItemSpec::any())
    }

    /// IPv4 item matching a destination under a prefix length.
    pub fn ipv4_dst(dst: Ipv4Addr, prefix_len: u8) -> Self {
        let bits = u32::MAX
            .checked_shl(32 - u32::from(prefix_len.min(32)))
            .unwrap_or(0);
        FlowItem::Ipv4(ItemSpec::masked(
            Ipv4Spec {
                dst,
                ..Ipv4Spec::default()
            },
            Ipv4Spec {
                dst: Ipv4Addr::from(bits),
                ..Ipv4Spec::default()
            },
        ))
    }

    pub fn udp() -> Self {
        FlowItem::Udp(ItemSpec::any())
    }

    pub fn udp_dst(port: u16) -> Self {
        FlowItem::Udp(ItemSpec::masked(
            UdpSpec {
                dst_port: port,
                src_port: 0,
            },
            UdpSpec {
                dst_port: u16::MAX,
                src_port: 0,
            },
        ))
    }

    pub fn vxlan() -> Self {
        FlowItem::Vxlan(ItemSpec::any())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_item_type_index_is_dense() {
        assert_eq!(ItemType::Void.index(), 0);
        assert_eq!(ItemType::Nvgre.index(), ItemType::COUNT - 1);
    }

    #[test]
    fn test_ipv4_prefix_mask() {
        let FlowItem::Ipv4(item) = FlowItem::ipv4_dst(Ipv4Addr::new(10, 0, 0, 0), 8) else {
            panic!("expected ipv4 item");
        };
        assert_eq!(item.mask.unwrap().dst, Ipv4Addr::new(255, 0, 0, 0));

        let FlowItem::Ipv4(item) = FlowItem::ipv4_dst(Ipv4Addr::new(10, 0, 0, 1), 0) else {
            panic!("expected ipv4 item");
        };
        assert_eq!(item.mask.unwrap().dst, Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_item_json() {
        let items: Vec<FlowItem> = serde_json::from_str(
            r#"[
                {"type": "eth"},
                {"type": "ipv4", "spec": {"dst": "10.0.0.1"}},
                {"type": "udp", "spec": {"dst_port": 4789}, "mask": {"dst_port": 65535}},
                {"type": "vxlan"}
            ]"#,
        )
        .unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(items[0], FlowItem::eth());
        assert_eq!(items[3].item_type(), ItemType::Vxlan);
        let FlowItem::Ipv4(ip) = &items[1] else {
            panic!("expected ipv4 item");
        };
        assert_eq!(ip.spec.unwrap().dst, Ipv4Addr::new(10, 0, 0, 1));
        assert!(ip.mask.is_none());
        assert_eq!(items[2], FlowItem::udp_dst(4789));
    }
}
