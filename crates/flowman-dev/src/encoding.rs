//! Device-level encodings consumed by the command channel.
//!
//! A match key is a (data, mask) pair of header sets, one per header level
//! (outer and inner for tunnels). Each header set carries a header-select
//! bitmap naming which fragments are populated, plus a metadata bitmap of
//! "packet is X" presence bits.
//!
//! Byte layout of individual fields is the firmware's business; these types
//! only fix which fragments exist and how they are grouped.

use std::fmt;

use bitflags::bitflags;
use thiserror::Error;

use crate::types::{ActionHandle, CounterId, TableHandle, VnicHandle};

/// Number of header levels in a match key (outer, inner).
pub const HDRSET_MAX: usize = 2;

/// Size of the raw L4 window in a header set.
pub const LAYER_SIZE: usize = 64;

/// Maximum number of operations in one action program, END included.
pub const ACTION_OP_MAX: usize = 64;

/// Maximum size of an encapsulation template.
pub const ACTION_DATA_SIZE: usize = 128;

/// Mark value reserved for the FLAG action.
pub const MAGIC_FILTER_ID: u32 = 0xffff;

bitflags! {
    /// Fragments present in a header set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HeaderSelect: u32 {
        const ETHER = 1 << 0;
        const QTAG = 1 << 1;
        const IPV4 = 1 << 2;
        const IPV6 = 1 << 3;
        const UDP = 1 << 4;
        const TCP = 1 << 5;
        const L4RAW = 1 << 6;
        const VXLAN = 1 << 7;
    }
}

bitflags! {
    /// Packet-type presence bits of a header set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Metadata: u32 {
        const QTAG = 1 << 0;
        const IPV4 = 1 << 1;
        const IPV6 = 1 << 2;
        const UDP = 1 << 3;
        const TCP = 1 << 4;
        const VXLAN = 1 << 5;
        /// Outer VLAN tag present.
        const VLAN_PRES = 1 << 6;
    }
}

bitflags! {
    /// Per-entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EntryFlags: u32 {
        const COUNTER = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EthFields {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub ether_type: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct VlanFields {
    pub tci: u16,
    pub inner_type: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Ipv4Fields {
    pub tos: u8,
    pub ttl: u8,
    pub proto: u8,
    pub src: u32,
    pub dst: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Ipv6Fields {
    pub vtc_flow: u32,
    pub proto: u8,
    pub hop_limits: u8,
    pub src: [u8; 16],
    pub dst: [u8; 16],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct L4Ports {
    pub src: u16,
    pub dst: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TcpFields {
    pub src: u16,
    pub dst: u16,
    pub flags: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct VxlanFields {
    pub flags: u8,
    pub vni: u32,
}

/// Raw bytes of the L4 layer, starting at the L4 header.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct L4Raw(pub [u8; LAYER_SIZE]);

impl Default for L4Raw {
    fn default() -> Self {
        L4Raw([0; LAYER_SIZE])
    }
}

impl fmt::Debug for L4Raw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let used = self.0.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        write!(f, "L4Raw(")?;
        for b in &self.0[..used] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// One header level of a match key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct HeaderSet {
    pub select: HeaderSelect,
    pub metadata: Metadata,
    pub eth: EthFields,
    pub vlan: VlanFields,
    pub ipv4: Ipv4Fields,
    pub ipv6: Ipv6Fields,
    pub udp: L4Ports,
    pub tcp: TcpFields,
    pub vxlan: VxlanFields,
    pub l4raw: L4Raw,
}

impl HeaderSet {
    /// Returns the fragments that carry non-zero content.
    pub fn populated(&self) -> HeaderSelect {
        let mut out = HeaderSelect::empty();
        out.set(HeaderSelect::ETHER, self.eth != EthFields::default());
        out.set(HeaderSelect::QTAG, self.vlan != VlanFields::default());
        out.set(HeaderSelect::IPV4, self.ipv4 != Ipv4Fields::default());
        out.set(HeaderSelect::IPV6, self.ipv6 != Ipv6Fields::default());
        out.set(HeaderSelect::UDP, self.udp != L4Ports::default());
        out.set(HeaderSelect::TCP, self.tcp != TcpFields::default());
        out.set(HeaderSelect::VXLAN, self.vxlan != VxlanFields::default());
        out.set(HeaderSelect::L4RAW, self.l4raw != L4Raw::default());
        out
    }
}

/// Compiled match key: data and mask across both header levels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MatchKey {
    pub data: [HeaderSet; HDRSET_MAX],
    pub mask: [HeaderSet; HDRSET_MAX],
}

impl MatchKey {
    /// Returns true if every populated fragment has its select bit set in
    /// both data and mask, and data and mask agree on the select bitmap.
    pub fn has_consistent_presence(&self) -> bool {
        self.data.iter().zip(self.mask.iter()).all(|(data, mask)| {
            data.select == mask.select
                && data.select.contains(data.populated())
                && mask.select.contains(mask.populated())
        })
    }
}

impl fmt::Display for MatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (level, (data, mask)) in self.data.iter().zip(self.mask.iter()).enumerate() {
            if level > 0 {
                write!(f, " ")?;
            }
            write!(
                f,
                "lvl{}[hdr={} meta={}/{}]",
                level,
                flag_names(data.select.iter_names().map(|(n, _)| n)),
                flag_names(data.metadata.iter_names().map(|(n, _)| n)),
                flag_names(mask.metadata.iter_names().map(|(n, _)| n)),
            )?;
        }
        Ok(())
    }
}

fn flag_names<'a>(names: impl Iterator<Item = &'a str>) -> String {
    let joined: Vec<&str> = names.collect();
    if joined.is_empty() {
        "-".to_string()
    } else {
        joined.join("|").to_lowercase()
    }
}

/// TCAM entry as handed to ENTRY_INSTALL on a group-0 table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchEntry {
    pub key: MatchKey,
    pub flags: EntryFlags,
    pub position: u32,
    pub action: ActionHandle,
    pub counter: Option<CounterId>,
}

impl fmt::Display for MatchEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} action={}", self.key, self.action)?;
        if let Some(counter) = self.counter {
            write!(f, " counter={}", counter)?;
        }
        Ok(())
    }
}

/// Exact-match entry: the data half of a match key without priority.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExactEntry {
    pub data: [HeaderSet; HDRSET_MAX],
    pub flags: EntryFlags,
    pub action: ActionHandle,
    pub counter: Option<CounterId>,
}

impl From<&MatchEntry> for ExactEntry {
    fn from(entry: &MatchEntry) -> Self {
        ExactEntry {
            data: entry.key.data,
            flags: entry.flags,
            action: entry.action,
            counter: entry.counter,
        }
    }
}

/// Field mask shared by every entry of an exact-match table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct KeyTemplate {
    pub headers: [HeaderSet; HDRSET_MAX],
    pub packet_tag: bool,
}

impl KeyTemplate {
    /// Template taken from a rule's mask.
    pub fn from_mask(key: &MatchKey) -> Self {
        KeyTemplate {
            headers: key.mask,
            packet_tag: true,
        }
    }

    /// Template of the per-direction default tables: IPv4 addresses and
    /// UDP ports.
    pub fn default_key() -> Self {
        let mut outer = HeaderSet {
            select: HeaderSelect::IPV4 | HeaderSelect::UDP,
            ..HeaderSet::default()
        };
        outer.ipv4.src = u32::MAX;
        outer.ipv4.dst = u32::MAX;
        outer.udp.src = u16::MAX;
        outer.udp.dst = u16::MAX;
        KeyTemplate {
            headers: [outer, HeaderSet::default()],
            packet_tag: true,
        }
    }

    /// Returns true if the key's mask equals this template.
    pub fn matches(&self, key: &MatchKey) -> bool {
        self.headers == key.mask
    }
}

/// One operation of an action program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOp {
    Drop,
    /// Steer to `rq_count` receive queues starting at `rq_index` on `vnic`.
    RqSteer {
        rq_index: u16,
        rq_count: u16,
        vnic: VnicHandle,
    },
    /// Continue lookup in an exact-match table.
    ExactMatch { table: TableHandle },
    Mark { mark: u32 },
    /// Prepend the program's template. The two length fields are patched at
    /// runtime with the inner packet length plus the given delta.
    Encap {
        len1_offset: u16,
        len1_delta: u16,
        len2_offset: u16,
        len2_delta: u16,
        outer_vlan: u16,
    },
    DecapNoStrip,
    PopVlan,
    SetOuterVlan { vlan: u16 },
    End,
}

impl ActionOp {
    /// Operation name as printed in program dumps.
    pub fn name(&self) -> &'static str {
        match self {
            ActionOp::Drop => "drop",
            ActionOp::RqSteer { .. } => "steer",
            ActionOp::ExactMatch { .. } => "exact_match",
            ActionOp::Mark { .. } => "mark",
            ActionOp::Encap { .. } => "encap",
            ActionOp::DecapNoStrip => "decap_nostrip",
            ActionOp::PopVlan => "pop_vlan",
            ActionOp::SetOuterVlan { .. } => "set_ovlan",
            ActionOp::End => "end",
        }
    }
}

/// The program already holds `ACTION_OP_MAX` operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("action program is limited to {} operations", ACTION_OP_MAX)]
pub struct ProgramFull;

/// Bounded, END-terminated sequence of action operations plus the
/// encapsulation template the ENCAP op refers to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionProgram {
    ops: Vec<ActionOp>,
    template: Vec<u8>,
}

impl ActionProgram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an operation.
    pub fn push(&mut self, op: ActionOp) -> Result<(), ProgramFull> {
        if self.ops.len() >= ACTION_OP_MAX {
            return Err(ProgramFull);
        }
        self.ops.push(op);
        Ok(())
    }

    pub fn ops(&self) -> &[ActionOp] {
        &self.ops
    }

    pub fn template(&self) -> &[u8] {
        &self.template
    }

    pub fn set_template(&mut self, template: Vec<u8>) {
        self.template = template;
    }

    /// Returns true if the last operation is END.
    pub fn is_terminated(&self) -> bool {
        matches!(self.ops.last(), Some(ActionOp::End))
    }

    /// Position of the first operation matching `pred`.
    pub fn position(&self, pred: impl Fn(&ActionOp) -> bool) -> Option<usize> {
        self.ops.iter().position(pred)
    }

    /// Moves the first STEER ahead of the first DECAP when DECAP comes first.
    ///
    /// The device requires steering to precede decapsulation.
    pub fn order_steer_before_decap(&mut self) {
        let decap = self.position(|op| matches!(op, ActionOp::DecapNoStrip));
        let steer = self.position(|op| matches!(op, ActionOp::RqSteer { .. }));
        if let (Some(decap), Some(steer)) = (decap, steer) {
            if decap < steer {
                self.ops.swap(decap, steer);
            }
        }
    }

    /// Target table of the EXACT-MATCH op, if any.
    pub fn jump_target(&self) -> Option<TableHandle> {
        self.ops.iter().find_map(|op| match op {
            ActionOp::ExactMatch { table } => Some(*table),
            _ => None,
        })
    }

    /// Points the EXACT-MATCH op at `table`. Returns false without one.
    pub fn retarget_jump(&mut self, table: TableHandle) -> bool {
        for op in self.ops.iter_mut() {
            if let ActionOp::ExactMatch { table: target } = op {
                *target = table;
                return true;
            }
        }
        false
    }
}

impl fmt::Display for ActionProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, op) in self.ops.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            match op {
                ActionOp::RqSteer {
                    rq_index,
                    rq_count,
                    vnic,
                } => write!(f, "steer({}+{}@{})", rq_index, rq_count, vnic)?,
                ActionOp::ExactMatch { table } => write!(f, "exact_match({})", table)?,
                ActionOp::Mark { mark } => write!(f, "mark({})", mark)?,
                ActionOp::SetOuterVlan { vlan } => write!(f, "set_ovlan(0x{:04x})", vlan)?,
                other => write!(f, "{}", other.name())?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn steer(rq: u16) -> ActionOp {
        ActionOp::RqSteer {
            rq_index: rq,
            rq_count: 1,
            vnic: VnicHandle::NULL,
        }
    }

    #[test]
    fn test_program_bound() {
        let mut program = ActionProgram::new();
        for _ in 0..ACTION_OP_MAX {
            program.push(ActionOp::PopVlan).unwrap();
        }
        assert_eq!(program.push(ActionOp::End), Err(ProgramFull));
        assert!(!program.is_terminated());
    }

    #[test]
    fn test_order_steer_before_decap() {
        let mut program = ActionProgram::new();
        program.push(ActionOp::DecapNoStrip).unwrap();
        program.push(ActionOp::Mark { mark: 3 }).unwrap();
        program.push(steer(2)).unwrap();
        program.push(ActionOp::End).unwrap();
        program.order_steer_before_decap();
        assert_eq!(
            program.ops(),
            &[steer(2), ActionOp::Mark { mark: 3 }, ActionOp::DecapNoStrip, ActionOp::End]
        );

        // Already ordered programs are left alone.
        let before = program.clone();
        program.order_steer_before_decap();
        assert_eq!(program, before);
    }

    #[test]
    fn test_retarget_jump() {
        let mut program = ActionProgram::new();
        program.push(ActionOp::Mark { mark: 1 }).unwrap();
        program
            .push(ActionOp::ExactMatch {
                table: TableHandle::from_raw_unchecked(7),
            })
            .unwrap();
        program.push(ActionOp::End).unwrap();

        assert!(program.retarget_jump(TableHandle::from_raw_unchecked(9)));
        assert_eq!(program.jump_target(), Some(TableHandle::from_raw_unchecked(9)));
        assert_eq!(program.to_string(), "mark(1),exact_match(0x9),end");

        let mut plain = ActionProgram::new();
        plain.push(ActionOp::Drop).unwrap();
        assert!(!plain.retarget_jump(TableHandle::from_raw_unchecked(9)));
        assert_eq!(plain.jump_target(), None);
    }

    #[test]
    fn test_exact_entry_drops_position() {
        let mut entry = MatchEntry {
            position: 12,
            flags: EntryFlags::COUNTER,
            counter: Some(CounterId(4)),
            ..MatchEntry::default()
        };
        entry.key.data[0].select = HeaderSelect::IPV4;
        entry.key.data[0].ipv4.dst = 0x0a00_0001;

        let exact = ExactEntry::from(&entry);
        assert_eq!(exact.data, entry.key.data);
        assert_eq!(exact.flags, EntryFlags::COUNTER);
        assert_eq!(exact.counter, Some(CounterId(4)));
    }

    #[test]
    fn test_key_template() {
        let template = KeyTemplate::default_key();
        assert_eq!(
            template.headers[0].select,
            HeaderSelect::IPV4 | HeaderSelect::UDP
        );
        assert!(template.packet_tag);

        let mut key = MatchKey::default();
        key.mask[0].select = HeaderSelect::IPV4;
        key.mask[0].ipv4.dst = u32::MAX;
        key.data[0].select = HeaderSelect::IPV4;
        assert!(KeyTemplate::from_mask(&key).matches(&key));
        assert!(!template.matches(&key));
    }

    #[test]
    fn test_presence_consistency() {
        let mut key = MatchKey::default();
        key.data[0].metadata = Metadata::IPV4;
        key.mask[0].metadata = Metadata::IPV4;
        assert!(key.has_consistent_presence());

        key.data[0].ipv4.src = 1;
        key.mask[0].ipv4.src = u32::MAX;
        assert!(!key.has_consistent_presence());

        key.data[0].select = HeaderSelect::IPV4;
        key.mask[0].select = HeaderSelect::IPV4;
        assert!(key.has_consistent_presence());
        assert_eq!(key.to_string(), "lvl0[hdr=ipv4 meta=ipv4/ipv4] lvl1[hdr=- meta=-/-]");
    }
}
