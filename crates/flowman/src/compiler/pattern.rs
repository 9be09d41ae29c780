//! Pattern compiler.
//!
//! Items are dispatched through [`ITEM_INFO`], a fixed table indexed by
//! [`ItemType`]. Each entry names the item's encoder, the item types it may
//! follow, and whether it may start a pattern. The tunnel item (VXLAN)
//! moves encoding from the outer header level to the inner one, after which
//! stacking is checked as if a new packet started.

use flowman_dev::{
    EthFields, HeaderSelect, HeaderSet, Ipv4Fields, Ipv6Fields, L4Ports, MatchKey, Metadata,
    TcpFields, VlanFields, VxlanFields, LAYER_SIZE,
};
use log::debug;

use crate::error::{FlowError, Result};
use crate::item::{
    DefaultMask, EthSpec, FlowItem, Ipv4Spec, Ipv6Spec, ItemType, RawSpec, SctpSpec, TcpSpec,
    UdpSpec, VlanSpec, VxlanSpec,
};

const IPPROTO_SCTP: u8 = 132;
const UDP_HDR_LEN: usize = 8;

/// Encoder state for one pattern.
struct CopyArgs<'a> {
    key: &'a mut MatchKey,
    level: usize,
}

impl CopyArgs<'_> {
    fn sets(&mut self) -> (&mut HeaderSet, &mut HeaderSet) {
        (&mut self.key.data[self.level], &mut self.key.mask[self.level])
    }

    fn set_metadata(&mut self, meta: Metadata) {
        let (data, mask) = self.sets();
        data.metadata |= meta;
        mask.metadata |= meta;
    }

    fn select(&mut self, fkh: HeaderSelect) {
        let (data, mask) = self.sets();
        data.select |= fkh;
        mask.select |= fkh;
    }
}

type CopyFn = fn(&FlowItem, &mut CopyArgs<'_>) -> Result<()>;

/// Dispatch entry of one item type.
struct ItemInfo {
    ty: ItemType,
    copy: CopyFn,
    prev_items: &'static [ItemType],
    valid_start: bool,
}

const fn item(
    ty: ItemType,
    copy: CopyFn,
    prev_items: &'static [ItemType],
    valid_start: bool,
) -> Option<ItemInfo> {
    Some(ItemInfo {
        ty,
        copy,
        prev_items,
        valid_start,
    })
}

/// Indexed by `ItemType::index()`. `None` marks item types the device
/// cannot match on.
static ITEM_INFO: [Option<ItemInfo>; ItemType::COUNT] = [
    // Void is skipped before dispatch.
    None,
    item(ItemType::Eth, copy_eth, &[], true),
    item(ItemType::Vlan, copy_vlan, &[ItemType::Eth], true),
    item(ItemType::Ipv4, copy_ipv4, &[ItemType::Eth, ItemType::Vlan], true),
    item(ItemType::Ipv6, copy_ipv6, &[ItemType::Eth, ItemType::Vlan], true),
    item(ItemType::Udp, copy_udp, &[ItemType::Ipv4, ItemType::Ipv6], true),
    item(ItemType::Tcp, copy_tcp, &[ItemType::Ipv4, ItemType::Ipv6], true),
    item(ItemType::Sctp, copy_sctp, &[ItemType::Ipv4, ItemType::Ipv6], false),
    item(ItemType::Vxlan, copy_vxlan, &[ItemType::Udp], true),
    item(ItemType::Raw, copy_raw, &[ItemType::Udp], false),
    // ICMP, GRE, GENEVE, MPLS, NVGRE
    None,
    None,
    None,
    None,
    None,
];

fn mismatch(item: &FlowItem) -> FlowError {
    FlowError::UnsupportedItem(format!("{} item dispatched to the wrong encoder", item.item_type()))
}

fn copy_eth(item: &FlowItem, args: &mut CopyArgs<'_>) -> Result<()> {
    let FlowItem::Eth(item) = item else {
        return Err(mismatch(item));
    };
    let Some(spec) = &item.spec else {
        return Ok(());
    };
    let mask = item.mask.unwrap_or_else(EthSpec::default_mask);
    let (data, m) = args.sets();
    data.eth = EthFields {
        dst: spec.dst,
        src: spec.src,
        ether_type: spec.ether_type,
    };
    m.eth = EthFields {
        dst: mask.dst,
        src: mask.src,
        ether_type: mask.ether_type,
    };
    args.select(HeaderSelect::ETHER);
    Ok(())
}

fn copy_vlan(item: &FlowItem, args: &mut CopyArgs<'_>) -> Result<()> {
    let FlowItem::Vlan(item) = item else {
        return Err(mismatch(item));
    };
    // Outer and inner tags use different presence bits.
    let meta = if args.level > 0 {
        Metadata::QTAG
    } else {
        Metadata::VLAN_PRES
    };
    args.set_metadata(meta);

    let Some(spec) = &item.spec else {
        return Ok(());
    };
    let mask = item.mask.unwrap_or_else(VlanSpec::default_mask);
    let (data, m) = args.sets();
    if m.eth.ether_type != 0 {
        return Err(FlowError::UnsupportedItem(
            "outer TPID cannot be matched".to_string(),
        ));
    }
    // The device compares vlan-stripped L2, so the inner type becomes the
    // ether type of the ETH fragment.
    data.eth.ether_type = spec.inner_type;
    m.eth.ether_type = mask.inner_type;
    data.vlan = VlanFields {
        tci: spec.tci,
        inner_type: 0,
    };
    m.vlan = VlanFields {
        tci: mask.tci,
        inner_type: 0,
    };
    args.select(HeaderSelect::ETHER | HeaderSelect::QTAG);
    Ok(())
}

fn ipv4_fields(spec: &Ipv4Spec) -> Ipv4Fields {
    Ipv4Fields {
        tos: spec.tos,
        ttl: spec.ttl,
        proto: spec.proto,
        src: u32::from(spec.src),
        dst: u32::from(spec.dst),
    }
}

fn copy_ipv4(item: &FlowItem, args: &mut CopyArgs<'_>) -> Result<()> {
    let FlowItem::Ipv4(item) = item else {
        return Err(mismatch(item));
    };
    args.set_metadata(Metadata::IPV4);
    let Some(spec) = &item.spec else {
        return Ok(());
    };
    let mask = item.mask.unwrap_or_else(Ipv4Spec::default_mask);
    let (data, m) = args.sets();
    data.ipv4 = ipv4_fields(spec);
    m.ipv4 = ipv4_fields(&mask);
    args.select(HeaderSelect::IPV4);
    Ok(())
}

fn ipv6_fields(spec: &Ipv6Spec) -> Ipv6Fields {
    Ipv6Fields {
        vtc_flow: spec.vtc_flow,
        proto: spec.proto,
        hop_limits: spec.hop_limits,
        src: spec.src.octets(),
        dst: spec.dst.octets(),
    }
}

fn copy_ipv6(item: &FlowItem, args: &mut CopyArgs<'_>) -> Result<()> {
    let FlowItem::Ipv6(item) = item else {
        return Err(mismatch(item));
    };
    args.set_metadata(Metadata::IPV6);
    let Some(spec) = &item.spec else {
        return Ok(());
    };
    let mask = item.mask.unwrap_or_else(Ipv6Spec::default_mask);
    let (data, m) = args.sets();
    data.ipv6 = ipv6_fields(spec);
    m.ipv6 = ipv6_fields(&mask);
    args.select(HeaderSelect::IPV6);
    Ok(())
}

fn copy_udp(item: &FlowItem, args: &mut CopyArgs<'_>) -> Result<()> {
    let FlowItem::Udp(item) = item else {
        return Err(mismatch(item));
    };
    args.set_metadata(Metadata::UDP);
    let Some(spec) = &item.spec else {
        return Ok(());
    };
    let mask = item.mask.unwrap_or_else(UdpSpec::default_mask);
    let (data, m) = args.sets();
    data.udp = L4Ports {
        src: spec.src_port,
        dst: spec.dst_port,
    };
    m.udp = L4Ports {
        src: mask.src_port,
        dst: mask.dst_port,
    };
    args.select(HeaderSelect::UDP);
    Ok(())
}

fn copy_tcp(item: &FlowItem, args: &mut CopyArgs<'_>) -> Result<()> {
    let FlowItem::Tcp(item) = item else {
        return Err(mismatch(item));
    };
    args.set_metadata(Metadata::TCP);
    let Some(spec) = &item.spec else {
        return Ok(());
    };
    let mask = item.mask.unwrap_or_else(TcpSpec::default_mask);
    let (data, m) = args.sets();
    data.tcp = TcpFields {
        src: spec.src_port,
        dst: spec.dst_port,
        flags: spec.flags,
    };
    m.tcp = TcpFields {
        src: mask.src_port,
        dst: mask.dst_port,
        flags: mask.flags,
    };
    args.select(HeaderSelect::TCP);
    Ok(())
}

fn sctp_header(spec: &SctpSpec) -> [u8; 8] {
    let mut hdr = [0u8; 8];
    hdr[0..2].copy_from_slice(&spec.src_port.to_be_bytes());
    hdr[2..4].copy_from_slice(&spec.dst_port.to_be_bytes());
    hdr[4..8].copy_from_slice(&spec.tag.to_be_bytes());
    hdr
}

/// SCTP has no header-select bit of its own: it is matched as the IP
/// protocol number plus the raw L4 bytes.
fn copy_sctp(item: &FlowItem, args: &mut CopyArgs<'_>) -> Result<()> {
    let FlowItem::Sctp(item) = item else {
        return Err(mismatch(item));
    };
    let (data, m) = args.sets();
    let l3 = if data.metadata.contains(Metadata::IPV4) {
        data.ipv4.proto = IPPROTO_SCTP;
        m.ipv4.proto = 0xff;
        HeaderSelect::IPV4
    } else if data.metadata.contains(Metadata::IPV6) {
        data.ipv6.proto = IPPROTO_SCTP;
        m.ipv6.proto = 0xff;
        HeaderSelect::IPV6
    } else {
        return Err(FlowError::UnsupportedItem(
            "SCTP needs an IPv4 or IPv6 item first".to_string(),
        ));
    };
    args.select(l3);

    let Some(spec) = &item.spec else {
        return Ok(());
    };
    let mask = item.mask.unwrap_or_else(SctpSpec::default_mask);
    let (data, m) = args.sets();
    data.l4raw.0[..8].copy_from_slice(&sctp_header(spec));
    m.l4raw.0[..8].copy_from_slice(&sctp_header(&mask));
    args.select(HeaderSelect::L4RAW);
    Ok(())
}

fn copy_vxlan(item: &FlowItem, args: &mut CopyArgs<'_>) -> Result<()> {
    let FlowItem::Vxlan(item) = item else {
        return Err(mismatch(item));
    };
    if args.level > 0 {
        return Err(FlowError::UnsupportedItem(
            "only two header levels are supported".to_string(),
        ));
    }
    args.set_metadata(Metadata::VXLAN);
    if let Some(spec) = &item.spec {
        let mask = item.mask.unwrap_or_else(VxlanSpec::default_mask);
        let (data, m) = args.sets();
        data.vxlan = VxlanFields {
            flags: spec.flags,
            vni: spec.vni,
        };
        m.vxlan = VxlanFields {
            flags: mask.flags,
            vni: mask.vni,
        };
        args.select(HeaderSelect::VXLAN);
    }
    // Items from here on describe the inner packet.
    args.level = 1;
    Ok(())
}

fn check_raw(spec: &RawSpec, mask: &RawSpec) -> Result<()> {
    let invalid = |why: &str| Err(FlowError::UnsupportedItem(format!("RAW: {}", why)));
    if !spec.relative || spec.offset != 0 || spec.search || spec.limit != 0 {
        return invalid("only relative matching at offset 0 is supported");
    }
    if spec.pattern.is_empty() || spec.pattern.len() + UDP_HDR_LEN > LAYER_SIZE {
        return invalid("pattern must be non-empty and fit the L4 window");
    }
    // An empty mask pattern means "same as spec".
    if !mask.pattern.is_empty() && mask.pattern.len() < spec.pattern.len() {
        return invalid("mask pattern is shorter than the spec pattern");
    }
    Ok(())
}

/// Raw payload right after the UDP header. The level's UDP ports move into
/// the first bytes of the raw window since the UDP fragment is deselected.
fn copy_raw(item: &FlowItem, args: &mut CopyArgs<'_>) -> Result<()> {
    let FlowItem::Raw(item) = item else {
        return Err(mismatch(item));
    };
    if args.level > 0 {
        return Err(FlowError::UnsupportedItem(
            "RAW cannot match the inner packet".to_string(),
        ));
    }
    let (Some(spec), Some(mask)) = (&item.spec, &item.mask) else {
        return Err(FlowError::UnsupportedItem(
            "RAW needs both spec and mask".to_string(),
        ));
    };
    check_raw(spec, mask)?;

    let len = spec.pattern.len();
    let (data, m) = args.sets();
    for set in [&mut *data, &mut *m] {
        let ports = std::mem::take(&mut set.udp);
        set.l4raw.0[0..2].copy_from_slice(&ports.src.to_be_bytes());
        set.l4raw.0[2..4].copy_from_slice(&ports.dst.to_be_bytes());
        set.select.remove(HeaderSelect::UDP);
        set.select.insert(HeaderSelect::L4RAW);
    }
    data.l4raw.0[UDP_HDR_LEN..UDP_HDR_LEN + len].copy_from_slice(&spec.pattern);
    let mask_bytes = if mask.pattern.is_empty() {
        &spec.pattern
    } else {
        &mask.pattern
    };
    m.l4raw.0[UDP_HDR_LEN..UDP_HDR_LEN + len].copy_from_slice(&mask_bytes[..len]);
    Ok(())
}

/// Whether `info` may follow `prev`.
fn stacking_valid(prev: Option<ItemType>, info: &ItemInfo, is_first: bool) -> bool {
    match prev {
        Some(prev) => info.prev_items.contains(&prev),
        None => is_first && info.valid_start,
    }
}

/// Compiles a pattern into a match key.
pub fn compile_pattern(pattern: &[FlowItem]) -> Result<MatchKey> {
    let mut key = MatchKey::default();
    let mut level = 0;
    let mut prev: Option<ItemType> = None;

    for item in pattern {
        let ty = item.item_type();
        if ty == ItemType::Void {
            continue;
        }
        let info = ITEM_INFO[ty.index()]
            .as_ref()
            .ok_or_else(|| FlowError::UnsupportedItem(format!("{} is not supported", ty)))?;

        if !stacking_valid(prev, info, prev.is_none()) {
            return Err(FlowError::InvalidStacking(match prev {
                Some(prev) => format!("{} cannot follow {}", info.ty, prev),
                None => format!("{} cannot start a pattern", info.ty),
            }));
        }

        let mut args = CopyArgs {
            key: &mut key,
            level,
        };
        (info.copy)(item, &mut args)?;

        if args.level != level {
            // The inner packet starts over.
            level = args.level;
            prev = None;
        } else {
            prev = Some(info.ty);
        }
    }

    debug!("FlowManager: compiled pattern {}", key);
    Ok(key)
}
