//! VXLAN encapsulation template.
//!
//! The template is the outer header stack the device prepends:
//! ETH [VLAN] IPV4|IPV6 UDP VXLAN. Two length fields in it depend on the
//! inner packet, so the ENCAP op records where they are and what constant
//! to add to the inner length.

use flowman_dev::{ActionOp, ACTION_DATA_SIZE};

use crate::error::{FlowError, Result};
use crate::item::{EthSpec, FlowItem, Ipv4Spec, Ipv6Spec, ItemSpec, UdpSpec, VxlanSpec};

const ETHER_TYPE_IPV4: u16 = 0x0800;
const ETHER_TYPE_IPV6: u16 = 0x86dd;
const IPPROTO_UDP: u8 = 17;
const IP_DEFTTL: u8 = 64;
const IPV4_VHL_DEF: u8 = 0x45;
const IP6_VTC_FLOW: u32 = 0x6000_0000;

const ETH_HDR_LEN: usize = 14;
const IPV4_HDR_LEN: usize = 20;
const IPV6_HDR_LEN: usize = 40;
const UDP_HDR_LEN: usize = 8;
const VXLAN_HDR_LEN: usize = 8;

fn encap_error(msg: &str) -> FlowError {
    FlowError::UnsupportedAction(format!("vxlan-encap: {}", msg))
}

fn spec_of<'a, T>(item: &'a ItemSpec<T>, name: &str) -> Result<&'a T> {
    item.spec
        .as_ref()
        .ok_or_else(|| encap_error(&format!("{} needs a spec", name)))
}

fn push_eth(template: &mut Vec<u8>, spec: &EthSpec) {
    template.extend_from_slice(&spec.dst);
    template.extend_from_slice(&spec.src);
    // Ether type is filled in once L3 is known.
    template.extend_from_slice(&[0, 0]);
}

fn push_ipv4(template: &mut Vec<u8>, spec: &Ipv4Spec) {
    let ttl = if spec.ttl == 0 { IP_DEFTTL } else { spec.ttl };
    template.extend_from_slice(&[IPV4_VHL_DEF, spec.tos, 0, 0, 0, 0, 0, 0, ttl, IPPROTO_UDP, 0, 0]);
    template.extend_from_slice(&spec.src.octets());
    template.extend_from_slice(&spec.dst.octets());
}

fn push_ipv6(template: &mut Vec<u8>, spec: &Ipv6Spec) {
    let hop_limits = if spec.hop_limits == 0 {
        IP_DEFTTL
    } else {
        spec.hop_limits
    };
    template.extend_from_slice(&(spec.vtc_flow | IP6_VTC_FLOW).to_be_bytes());
    template.extend_from_slice(&[0, 0, IPPROTO_UDP, hop_limits]);
    template.extend_from_slice(&spec.src.octets());
    template.extend_from_slice(&spec.dst.octets());
}

fn push_udp(template: &mut Vec<u8>, spec: &UdpSpec) {
    template.extend_from_slice(&spec.src_port.to_be_bytes());
    template.extend_from_slice(&spec.dst_port.to_be_bytes());
    template.extend_from_slice(&[0, 0, 0, 0]);
}

fn push_vxlan(template: &mut Vec<u8>, spec: &VxlanSpec) {
    let vni = (spec.vni & 0x00ff_ffff).to_be_bytes();
    template.extend_from_slice(&[spec.flags, 0, 0, 0, vni[1], vni[2], vni[3], 0]);
}

fn offset(len: usize) -> u16 {
    // Bounded by ACTION_DATA_SIZE, checked by the caller.
    u16::try_from(len).unwrap_or(u16::MAX)
}

/// Builds the ENCAP op and its template from an encap definition.
pub(super) fn build_vxlan_encap(definition: &[FlowItem]) -> Result<(ActionOp, Vec<u8>)> {
    let mut items = definition
        .iter()
        .filter(|item| !matches!(item, FlowItem::Void))
        .peekable();
    let mut template = Vec::with_capacity(ETH_HDR_LEN + IPV6_HDR_LEN + UDP_HDR_LEN + VXLAN_HDR_LEN);
    let mut outer_vlan = 0;

    match items.next() {
        Some(FlowItem::Eth(eth)) => push_eth(&mut template, spec_of(eth, "ETH")?),
        _ => return Err(encap_error("first item should be ethernet")),
    }

    if let Some(FlowItem::Vlan(vlan)) = items.peek() {
        outer_vlan = spec_of(vlan, "VLAN")?.tci;
        items.next();
    }

    let l3_off = template.len();
    let (ether_type, len1_offset, len1_delta) = match items.next() {
        Some(FlowItem::Ipv4(ip)) => {
            push_ipv4(&mut template, spec_of(ip, "IPV4")?);
            (
                ETHER_TYPE_IPV4,
                l3_off + 2,
                IPV4_HDR_LEN + UDP_HDR_LEN + VXLAN_HDR_LEN,
            )
        }
        Some(FlowItem::Ipv6(ip)) => {
            push_ipv6(&mut template, spec_of(ip, "IPV6")?);
            (ETHER_TYPE_IPV6, l3_off + 4, UDP_HDR_LEN + VXLAN_HDR_LEN)
        }
        _ => return Err(encap_error("L3 must be IPv4/IPv6")),
    };
    template[12..14].copy_from_slice(&ether_type.to_be_bytes());

    let l4_off = template.len();
    match items.next() {
        Some(FlowItem::Udp(udp)) => push_udp(&mut template, spec_of(udp, "UDP")?),
        _ => return Err(encap_error("UDP must follow IPv4/IPv6")),
    }

    match items.next() {
        Some(FlowItem::Vxlan(vxlan)) => push_vxlan(&mut template, spec_of(vxlan, "VXLAN")?),
        _ => return Err(encap_error("VXLAN must follow UDP")),
    }

    if items.next().is_some() {
        return Err(encap_error("nothing may follow VXLAN"));
    }
    if template.len() > ACTION_DATA_SIZE {
        return Err(encap_error("template too large"));
    }

    let op = ActionOp::Encap {
        len1_offset: offset(len1_offset),
        len1_delta: offset(len1_delta),
        len2_offset: offset(l4_off + 4),
        len2_delta: offset(UDP_HDR_LEN + VXLAN_HDR_LEN),
        outer_vlan,
    };
    Ok((op, template))
}
