//! Action compiler.
//!
//! Actions fall into exclusive categories. FATE (DROP, JUMP, QUEUE, RSS)
//! decides where the packet goes; QUEUE and RSS may repeat among
//! themselves but exclude DROP and JUMP. DECAP, ENCAP, PASSTHRU and COUNT
//! are each usable once. COUNT sets an entry flag instead of emitting an op.

use std::collections::HashMap;

use bitflags::bitflags;
use flowman_dev::{
    ActionOp, ActionProgram, DeviceChannel, Direction, EntryFlags, FlowApi, MatchKey, Metadata,
    TableHandle, VnicHandle, MAGIC_FILTER_ID,
};

use super::encap::build_vxlan_encap;
use crate::action::{ActionType, FlowAction, RssConf, RssFunction};
use crate::error::{FlowError, Result};
use crate::types::{PciAddress, TCAM_GROUP};

const ETHER_TYPE_VLAN: u16 = 0x8100;
const VLAN_PCP_SHIFT: u16 = 13;
const VLAN_VID_MASK: u16 = 0x0fff;

const INGRESS_ACTIONS: &[ActionType] = &[
    ActionType::Count,
    ActionType::Drop,
    ActionType::Flag,
    ActionType::Jump,
    ActionType::Mark,
    ActionType::PopVlan,
    ActionType::PortId,
    ActionType::Passthru,
    ActionType::Queue,
    ActionType::Rss,
    ActionType::Void,
    ActionType::VxlanDecap,
    ActionType::VxlanEncap,
];

const EGRESS_ACTIONS: &[ActionType] = &[
    ActionType::Count,
    ActionType::Drop,
    ActionType::Jump,
    ActionType::Passthru,
    ActionType::PushVlan,
    ActionType::SetVlanPcp,
    ActionType::SetVlanVid,
    ActionType::Void,
    ActionType::VxlanEncap,
];

/// Actions accepted for rules of `direction`.
pub fn supported_actions(direction: Direction) -> &'static [ActionType] {
    match direction {
        Direction::Ingress => INGRESS_ACTIONS,
        Direction::Egress => EGRESS_ACTIONS,
    }
}

bitflags! {
    /// Categories already used by the rule.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct Overlap: u32 {
        const FATE = 1 << 0;
        const DECAP = 1 << 1;
        const PASSTHRU = 1 << 2;
        const COUNT = 1 << 3;
        const ENCAP = 1 << 4;
        const PUSH_VLAN = 1 << 5;
    }
}

/// Resolves PORT_ID actions to the vNIC serving the port.
pub trait VnicResolver {
    fn find_vnic(&mut self, port_id: u16) -> Result<VnicHandle>;
}

/// Resolves ports through VNIC_FIND on the device.
pub struct DeviceVnics<'a, C: DeviceChannel> {
    pub ports: &'a HashMap<u16, PciAddress>,
    pub device: &'a mut C,
}

impl<C: DeviceChannel> VnicResolver for DeviceVnics<'_, C> {
    fn find_vnic(&mut self, port_id: u16) -> Result<VnicHandle> {
        let addr = self.ports.get(&port_id).ok_or_else(|| {
            FlowError::UnsupportedAction(format!("PORT_ID: unknown port {}", port_id))
        })?;
        self.device.vnic_find(addr.bdf()).map_err(|e| {
            FlowError::UnsupportedAction(format!(
                "PORT_ID: no vNIC for port {} at {}: {}",
                port_id, addr, e
            ))
        })
    }
}

/// Checks that a port is configured without asking the device.
pub struct ConfiguredPorts<'a> {
    pub ports: &'a HashMap<u16, PciAddress>,
}

impl VnicResolver for ConfiguredPorts<'_> {
    fn find_vnic(&mut self, port_id: u16) -> Result<VnicHandle> {
        if self.ports.contains_key(&port_id) {
            Ok(VnicHandle::NULL)
        } else {
            Err(FlowError::UnsupportedAction(format!(
                "PORT_ID: unknown port {}",
                port_id
            )))
        }
    }
}

/// Per-rule inputs of the action compiler.
#[derive(Debug, Clone, Copy)]
pub struct ActionContext {
    pub direction: Direction,
    pub group: u32,
    pub rq_count: u16,
    pub rss_hf: u64,
}

/// Output of the action compiler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledActions {
    pub program: ActionProgram,
    pub flags: EntryFlags,
    /// Group named by a JUMP. The EXACT-MATCH op targets the null table
    /// until the table registry resolves it.
    pub jump_group: Option<u32>,
}

fn combination(msg: &str) -> FlowError {
    FlowError::InvalidActionCombination(msg.to_string())
}

fn push(program: &mut ActionProgram, op: ActionOp) -> Result<()> {
    program
        .push(op)
        .map_err(|e| FlowError::UnsupportedAction(e.to_string()))
}

/// RSS is limited to the default hash over the outer headers, with the
/// configured hash types, spread over a run of consecutive queues.
fn check_rss(rss: &RssConf, ctx: &ActionContext) -> Result<()> {
    let unsupported = |why: String| Err(FlowError::UnsupportedAction(format!("RSS: {}", why)));
    if rss.func != RssFunction::Default {
        return unsupported(format!("hash function {:?}", rss.func));
    }
    if rss.level != 0 {
        return unsupported(format!("level {}", rss.level));
    }
    if rss.types != 0 && rss.types != ctx.rss_hf {
        return unsupported(format!("hash types {:#x}", rss.types));
    }
    let Some(&first) = rss.queues.first() else {
        return unsupported("empty queue list".to_string());
    };
    if rss.queues.len() > usize::from(ctx.rq_count) {
        return unsupported(format!("{} queues", rss.queues.len()));
    }
    if rss.queues.iter().any(|&q| q >= ctx.rq_count) {
        return unsupported("queue index out of range".to_string());
    }
    let sequential = rss
        .queues
        .windows(2)
        .all(|pair| u32::from(pair[1]) == u32::from(pair[0]) + 1);
    if !sequential {
        return unsupported(format!("queues must be consecutive from {}", first));
    }
    Ok(())
}

/// Compiles a rule's action list against its compiled pattern `key`.
pub fn compile_actions(
    actions: &[FlowAction],
    key: &MatchKey,
    ctx: &ActionContext,
    vnics: &mut dyn VnicResolver,
) -> Result<CompiledActions> {
    let supported = supported_actions(ctx.direction);
    let mut out = CompiledActions::default();
    let mut overlap = Overlap::empty();
    let mut first_rq = true;
    let mut vnic = VnicHandle::NULL;
    let mut ovlan: u16 = 0;
    let mut need_ovlan = false;

    for action in actions {
        let ty = action.action_type();
        if !supported.contains(&ty) {
            return Err(FlowError::UnsupportedAction(format!(
                "{} is not supported for {} rules",
                ty, ctx.direction
            )));
        }
        let program = &mut out.program;

        match action {
            FlowAction::Void => {}
            FlowAction::Passthru => {
                if overlap.contains(Overlap::PASSTHRU) {
                    return Err(combination("more than one PASSTHRU"));
                }
                if overlap.contains(Overlap::FATE) {
                    return Err(combination("PASSTHRU with a fate action"));
                }
                overlap |= Overlap::PASSTHRU;
            }
            FlowAction::Jump { group } => {
                if overlap.intersects(Overlap::FATE | Overlap::PASSTHRU) {
                    return Err(combination("JUMP with another fate action"));
                }
                if ctx.group != TCAM_GROUP {
                    return Err(FlowError::UnsupportedAction(format!(
                        "JUMP from group {}: only group 0 rules may jump",
                        ctx.group
                    )));
                }
                if *group == TCAM_GROUP {
                    return Err(FlowError::UnsupportedAction("JUMP to group 0".to_string()));
                }
                overlap |= Overlap::FATE;
                push(program, ActionOp::ExactMatch {
                    table: TableHandle::NULL,
                })?;
                out.jump_group = Some(*group);
            }
            FlowAction::Mark { id } => {
                if *id >= MAGIC_FILTER_ID - 1 {
                    return Err(FlowError::UnsupportedAction(format!(
                        "MARK id {} is reserved",
                        id
                    )));
                }
                push(program, ActionOp::Mark { mark: id + 1 })?;
            }
            FlowAction::Flag => {
                push(program, ActionOp::Mark {
                    mark: MAGIC_FILTER_ID,
                })?;
            }
            FlowAction::Queue { index } => {
                if overlap.contains(Overlap::FATE) && first_rq {
                    return Err(combination("QUEUE with DROP or JUMP"));
                }
                if overlap.contains(Overlap::PASSTHRU) {
                    return Err(combination("QUEUE with PASSTHRU"));
                }
                if *index >= ctx.rq_count {
                    return Err(FlowError::UnsupportedAction(format!(
                        "QUEUE {} out of range ({} queues)",
                        index, ctx.rq_count
                    )));
                }
                overlap |= Overlap::FATE;
                first_rq = false;
                push(program, ActionOp::RqSteer {
                    rq_index: *index,
                    rq_count: 1,
                    vnic,
                })?;
            }
            FlowAction::Rss(rss) => {
                if overlap.contains(Overlap::FATE) && first_rq {
                    return Err(combination("RSS with DROP or JUMP"));
                }
                if overlap.contains(Overlap::PASSTHRU) {
                    return Err(combination("RSS with PASSTHRU"));
                }
                check_rss(rss, ctx)?;
                overlap |= Overlap::FATE;
                first_rq = false;
                // check_rss bounds the length by rq_count.
                let rq_count = u16::try_from(rss.queues.len()).unwrap_or(u16::MAX);
                push(program, ActionOp::RqSteer {
                    rq_index: rss.queues[0],
                    rq_count,
                    vnic,
                })?;
            }
            FlowAction::Drop => {
                if overlap.intersects(Overlap::FATE | Overlap::PASSTHRU) {
                    return Err(combination("DROP with another fate action"));
                }
                overlap |= Overlap::FATE;
                push(program, ActionOp::Drop)?;
            }
            FlowAction::Count => {
                if overlap.contains(Overlap::COUNT) {
                    return Err(combination("more than one COUNT"));
                }
                overlap |= Overlap::COUNT;
                out.flags |= EntryFlags::COUNTER;
            }
            FlowAction::PortId { original, id } => {
                vnic = if *original {
                    VnicHandle::NULL
                } else {
                    vnics.find_vnic(*id)?
                };
            }
            FlowAction::VxlanDecap => {
                if overlap.contains(Overlap::DECAP) {
                    return Err(combination("more than one VXLAN_DECAP"));
                }
                if !key.mask[0].metadata.contains(Metadata::VXLAN) {
                    return Err(FlowError::UnsupportedAction(
                        "VXLAN_DECAP needs VXLAN in the pattern".to_string(),
                    ));
                }
                overlap |= Overlap::DECAP;
                push(program, ActionOp::DecapNoStrip)?;
            }
            FlowAction::VxlanEncap { definition } => {
                if overlap.contains(Overlap::ENCAP) {
                    return Err(combination("more than one VXLAN_ENCAP"));
                }
                let (op, template) = build_vxlan_encap(definition)?;
                overlap |= Overlap::ENCAP;
                program.set_template(template);
                push(program, op)?;
            }
            FlowAction::PopVlan => {
                push(program, ActionOp::PopVlan)?;
            }
            FlowAction::PushVlan { ether_type } => {
                if overlap.contains(Overlap::PUSH_VLAN) {
                    return Err(combination("more than one PUSH_VLAN"));
                }
                if *ether_type != ETHER_TYPE_VLAN {
                    return Err(FlowError::UnsupportedAction(format!(
                        "PUSH_VLAN ether type {:#06x}",
                        ether_type
                    )));
                }
                overlap |= Overlap::PUSH_VLAN;
                need_ovlan = true;
            }
            FlowAction::SetVlanPcp { pcp } => {
                if *pcp > 7 {
                    return Err(FlowError::UnsupportedAction(format!(
                        "VLAN PCP {} out of range",
                        pcp
                    )));
                }
                ovlan |= u16::from(*pcp) << VLAN_PCP_SHIFT;
                need_ovlan = true;
            }
            FlowAction::SetVlanVid { vid } => {
                if *vid > VLAN_VID_MASK {
                    return Err(FlowError::UnsupportedAction(format!(
                        "VLAN VID {} out of range",
                        vid
                    )));
                }
                ovlan |= vid;
                need_ovlan = true;
            }
            FlowAction::Meter { .. } | FlowAction::SetTtl { .. } => {
                return Err(FlowError::UnsupportedAction(format!("{} is not supported", ty)));
            }
        }
    }

    if !overlap.intersects(Overlap::FATE | Overlap::PASSTHRU | Overlap::COUNT) {
        return Err(combination("no fate, PASSTHRU or COUNT action"));
    }
    if need_ovlan {
        push(&mut out.program, ActionOp::SetOuterVlan { vlan: ovlan })?;
    }
    push(&mut out.program, ActionOp::End)?;
    out.program.order_steer_before_decap();
    Ok(out)
}
