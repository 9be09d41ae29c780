//! Match/action compiler.
//!
//! Turns a rule's pattern and action list into the entry and action program
//! the device consumes. Compilation never touches device state beyond
//! PORT_ID lookups, so every error here is raised before any resource is
//! allocated.

pub mod actions;
mod encap;
pub mod pattern;

use flowman_dev::{ActionProgram, Direction, EntryFlags, MatchEntry};
use log::debug;

use crate::action::FlowAction;
use crate::error::Result;
use crate::item::FlowItem;

pub use actions::{
    compile_actions, supported_actions, ActionContext, CompiledActions, ConfiguredPorts,
    DeviceVnics, VnicResolver,
};
pub use pattern::compile_pattern;

/// A compiled rule, ready for installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledFlow {
    pub direction: Direction,
    pub group: u32,
    /// Entry with a null action and no counter; both are filled in at install.
    pub entry: MatchEntry,
    pub program: ActionProgram,
    pub jump_group: Option<u32>,
}

impl CompiledFlow {
    /// Returns true if the rule asked for a counter.
    pub fn counted(&self) -> bool {
        self.entry.flags.contains(EntryFlags::COUNTER)
    }
}

/// Compiles one rule.
pub fn compile(
    pattern: &[FlowItem],
    actions: &[FlowAction],
    ctx: &ActionContext,
    vnics: &mut dyn VnicResolver,
) -> Result<CompiledFlow> {
    let key = compile_pattern(pattern)?;
    let compiled = compile_actions(actions, &key, ctx, vnics)?;
    let entry = MatchEntry {
        key,
        flags: compiled.flags,
        ..MatchEntry::default()
    };
    debug!(
        "FlowManager: compiled {} group {} rule: {} program {}",
        ctx.direction, ctx.group, entry.key, compiled.program
    );
    Ok(CompiledFlow {
        direction: ctx.direction,
        group: ctx.group,
        entry,
        program: compiled.program,
        jump_group: compiled.jump_group,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlowError;
    use flowman_dev::{ActionOp, VnicHandle};
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    struct NoPorts;

    impl VnicResolver for NoPorts {
        fn find_vnic(&mut self, _port_id: u16) -> Result<VnicHandle> {
            Err(FlowError::UnsupportedAction("no ports".to_string()))
        }
    }

    fn ingress(group: u32) -> ActionContext {
        ActionContext {
            direction: Direction::Ingress,
            group,
            rq_count: 4,
            rss_hf: 0,
        }
    }

    #[test]
    fn test_compile_queue_rule() {
        let flow = compile(
            &[
                FlowItem::eth(),
                FlowItem::ipv4_dst(Ipv4Addr::new(10, 0, 0, 1), 32),
            ],
            &[FlowAction::Queue { index: 3 }],
            &ingress(0),
            &mut NoPorts,
        )
        .unwrap();
        assert_eq!(flow.group, 0);
        assert!(!flow.counted());
        assert_eq!(flow.jump_group, None);
        assert_eq!(flow.entry.key.mask[0].ipv4.dst, u32::MAX);
        assert_eq!(flow.entry.key.data[0].ipv4.dst, 0x0a00_0001);
        assert_eq!(flow.program.ops().len(), 2);
        assert!(matches!(flow.program.ops()[0], ActionOp::RqSteer { rq_index: 3, .. }));
    }

    #[test]
    fn test_pattern_errors_come_first() {
        let result = compile(
            &[FlowItem::udp(), FlowItem::eth()],
            &[FlowAction::Meter { id: 1 }],
            &ingress(0),
            &mut NoPorts,
        );
        assert!(matches!(result, Err(FlowError::InvalidStacking(_))));
    }
}
