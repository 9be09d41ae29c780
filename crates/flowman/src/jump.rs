//! Jump resolver.
//!
//! A group-0 rule that jumps to a group without a table is installed
//! against the default table and parked here. When the group's table is
//! created, every parked rule for it is reinstalled with its EXACT-MATCH op
//! pointing at the new table.
//!
//! Conversion is best effort: a rule that fails to convert is left without
//! a device entry and reported, and the rules converted before it stay
//! converted.

use flowman_dev::{ActionProgram, DeviceChannel, Direction, FlowApi, MatchEntry};
use log::{debug, error, info, warn};

use crate::error::{FlowError, Result};
use crate::manager::{FlowManager, FlowRule};
use crate::table::FetId;
use crate::types::{FlowId, FlowState};

/// A parked rule with the compiled entry and program it was created from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpFlow {
    pub flow: FlowId,
    pub group: u32,
    pub direction: Direction,
    pub entry: MatchEntry,
    pub program: ActionProgram,
}

/// Rules waiting for their jump target to materialize.
#[derive(Debug, Default)]
pub struct JumpResolver {
    pending: Vec<JumpFlow>,
}

impl JumpResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_pending(&mut self, jump: JumpFlow) {
        debug!(
            "FlowManager: {} waits for {} group {}",
            jump.flow, jump.direction, jump.group
        );
        self.pending.push(jump);
    }

    /// Forgets a rule. Returns true if it was pending.
    pub fn remove_flow(&mut self, flow: FlowId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|jump| jump.flow != flow);
        self.pending.len() != before
    }

    /// Removes and returns the rules waiting for (group, direction).
    pub fn take_for(&mut self, group: u32, direction: Direction) -> Vec<JumpFlow> {
        let (matched, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|jump| jump.group == group && jump.direction == direction);
        self.pending = rest;
        matched
    }

    pub fn is_pending(&self, flow: FlowId) -> bool {
        self.pending.iter().any(|jump| jump.flow == flow)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Outcome of one promotion batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JumpConversion {
    pub converted: Vec<FlowId>,
    pub failed: Vec<(FlowId, FlowError)>,
}

impl<C: DeviceChannel> FlowManager<C> {
    /// Points every rule parked on (group, direction) of `fet` at it.
    pub(crate) fn resolve_new_table(&mut self, fet: FetId) -> JumpConversion {
        let mut outcome = JumpConversion::default();
        let Some((group, direction, handle)) = self
            .tables
            .get(fet)
            .map(|table| (table.group, table.direction, table.handle))
        else {
            return outcome;
        };

        for jump in self.jumps.take_for(group, direction) {
            match self.convert_jump_flow(&jump, fet) {
                Ok(()) => {
                    self.stats.jump_flows_converted =
                        self.stats.jump_flows_converted.saturating_add(1);
                    outcome.converted.push(jump.flow);
                }
                Err(e) => {
                    error!(
                        "FlowManager: cannot convert {} to {} table {} of group {}: {}",
                        jump.flow, direction, handle, group, e
                    );
                    self.stats.jump_flows_failed = self.stats.jump_flows_failed.saturating_add(1);
                    outcome.failed.push((jump.flow, e));
                }
            }
        }

        if !outcome.converted.is_empty() {
            info!(
                "FlowManager: {} jump flows now target {} group {}",
                outcome.converted.len(),
                direction,
                group
            );
        }
        outcome
    }

    fn convert_jump_flow(&mut self, jump: &JumpFlow, fet: FetId) -> Result<()> {
        let Some(mut rule) = self.flows.remove(&jump.flow) else {
            warn!("FlowManager: pending {} no longer exists", jump.flow);
            return Ok(());
        };
        let result = self.reinstall_jump(&mut rule, jump, fet);
        self.flows.insert(rule.id, rule);
        result
    }

    fn reinstall_jump(
        &mut self,
        rule: &mut FlowRule,
        jump: &JumpFlow,
        fet: FetId,
    ) -> Result<()> {
        let handle = self
            .tables
            .handle(fet)
            .ok_or_else(|| FlowError::Unsupported(format!("unknown table {}", fet)))?;

        // The old entry still jumps to the default table.
        self.release_entry(rule);

        let mut program = jump.program.clone();
        program.retarget_jump(handle);
        let action = self.device.action_alloc(&program)?;

        let mut entry = jump.entry.clone();
        entry.action = action;
        entry.counter = rule.counter;
        let tcam = self.tables.tcam_handle(jump.direction);
        let entry_handle = match self.device.tcam_entry_install(tcam, &entry) {
            Ok(entry_handle) => entry_handle,
            Err(e) => {
                if let Err(e) = self.device.action_free(action) {
                    error!("FlowManager: failed to free action {}: {}", action, e);
                }
                return Err(e.into());
            }
        };

        self.tables.hold(fet)?;
        if let Some(old) = rule.fet.replace(fet) {
            if let Err(e) = self.tables.put_table(old, &mut self.device) {
                error!("FlowManager: failed to release default table: {}", e);
            }
        }
        rule.entry = entry;
        rule.program = program;
        rule.action_handle = action;
        rule.entry_handle = entry_handle;
        rule.state = FlowState::Installed;
        debug!("FlowManager: converted {}", rule);
        Ok(())
    }
}
