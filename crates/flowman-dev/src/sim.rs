//! In-memory model of the flow manager firmware.
//!
//! [`SimDevice`] implements [`DeviceChannel`] without hardware. It keeps
//! every table, entry, action object and counter it hands out, enforces the
//! same reference rules the firmware does (an entry needs a live table and
//! action, a table or action in use cannot be freed), and can be told to
//! fail a specific upcoming command.

use std::collections::{BTreeMap, HashMap};

use crate::api::{DevCommand, DevReply, DeviceChannel, EntrySpec, Opcode, TableSpec};
use crate::encoding::{ActionOp, ActionProgram, ExactEntry, KeyTemplate, MatchEntry};
use crate::error::{DevError, DevResult, DevStatus};
use crate::types::{
    ActionHandle, CounterId, CounterStats, Direction, EntryHandle, RawHandle, TableHandle,
};

/// A table held by the simulated device.
#[derive(Debug, Clone)]
pub struct SimTable {
    pub direction: Direction,
    pub max_entries: u32,
    /// Key template for exact-match tables, `None` for TCAM tables.
    pub key: Option<KeyTemplate>,
    pub entries: Vec<EntryHandle>,
}

impl SimTable {
    pub fn is_tcam(&self) -> bool {
        self.key.is_none()
    }
}

/// An installed entry as the device received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEntry {
    Tcam {
        table: TableHandle,
        entry: MatchEntry,
    },
    Exact {
        table: TableHandle,
        entry: ExactEntry,
    },
}

impl SimEntry {
    pub fn table(&self) -> TableHandle {
        match self {
            SimEntry::Tcam { table, .. } | SimEntry::Exact { table, .. } => *table,
        }
    }

    pub fn action(&self) -> ActionHandle {
        match self {
            SimEntry::Tcam { entry, .. } => entry.action,
            SimEntry::Exact { entry, .. } => entry.action,
        }
    }

    pub fn counter(&self) -> Option<CounterId> {
        match self {
            SimEntry::Tcam { entry, .. } => entry.counter,
            SimEntry::Exact { entry, .. } => entry.counter,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PlannedFailure {
    opcode: Opcode,
    skip: usize,
    status: DevStatus,
}

/// Simulated device.
#[derive(Debug)]
pub struct SimDevice {
    next_handle: RawHandle,
    tables: BTreeMap<RawHandle, SimTable>,
    entries: BTreeMap<RawHandle, SimEntry>,
    actions: BTreeMap<RawHandle, ActionProgram>,
    counters_total: u32,
    counter_values: HashMap<u32, CounterStats>,
    counter_limit: Option<u32>,
    vnics: HashMap<u32, RawHandle>,
    failures: Vec<PlannedFailure>,
    history: Vec<Opcode>,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice {
    pub fn new() -> Self {
        Self {
            next_handle: 0x1000,
            tables: BTreeMap::new(),
            entries: BTreeMap::new(),
            actions: BTreeMap::new(),
            counters_total: 0,
            counter_values: HashMap::new(),
            counter_limit: None,
            vnics: HashMap::new(),
            failures: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Registers a vNIC reachable at `bdf`.
    pub fn with_vnic(mut self, bdf: u32, handle: RawHandle) -> Self {
        self.vnics.insert(bdf, handle);
        self
    }

    /// Caps the total number of counters the device will hand out.
    pub fn with_counter_limit(mut self, limit: u32) -> Self {
        self.counter_limit = Some(limit);
        self
    }

    /// Fails the next command with `opcode`.
    pub fn fail_next(&mut self, opcode: Opcode, status: DevStatus) {
        self.fail_nth(opcode, 0, status);
    }

    /// Lets `skip` commands with `opcode` through, then fails the next one.
    pub fn fail_nth(&mut self, opcode: Opcode, skip: usize, status: DevStatus) {
        self.failures.push(PlannedFailure {
            opcode,
            skip,
            status,
        });
    }

    /// Sets the value a counter reports.
    pub fn set_counter(&mut self, counter: CounterId, stats: CounterStats) {
        self.counter_values.insert(counter.0, stats);
    }

    pub fn table(&self, table: TableHandle) -> Option<&SimTable> {
        self.tables.get(&table.as_raw())
    }

    pub fn tables(&self) -> impl Iterator<Item = (TableHandle, &SimTable)> {
        self.tables
            .iter()
            .map(|(raw, table)| (TableHandle::from_raw_unchecked(*raw), table))
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn exact_table_count(&self) -> usize {
        self.tables.values().filter(|t| !t.is_tcam()).count()
    }

    pub fn entry(&self, entry: EntryHandle) -> Option<&SimEntry> {
        self.entries.get(&entry.as_raw())
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of entries installed in `table`.
    pub fn entries_in(&self, table: TableHandle) -> usize {
        self.table(table).map_or(0, |t| t.entries.len())
    }

    pub fn action(&self, action: ActionHandle) -> Option<&ActionProgram> {
        self.actions.get(&action.as_raw())
    }

    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    pub fn counters_total(&self) -> u32 {
        self.counters_total
    }

    /// Opcodes of every command received, in order.
    pub fn history(&self) -> &[Opcode] {
        &self.history
    }

    /// Number of commands received with `opcode`.
    pub fn command_count(&self, opcode: Opcode) -> usize {
        self.history.iter().filter(|op| **op == opcode).count()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    fn alloc_handle(&mut self) -> RawHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn take_failure(&mut self, opcode: Opcode) -> Option<DevStatus> {
        let idx = self.failures.iter().position(|f| f.opcode == opcode)?;
        if self.failures[idx].skip > 0 {
            self.failures[idx].skip -= 1;
            return None;
        }
        Some(self.failures.remove(idx).status)
    }

    fn install(&mut self, table: TableHandle, entry: EntrySpec<'_>) -> Result<DevReply, DevStatus> {
        let target = self.tables.get(&table.as_raw()).ok_or(DevStatus::NotFound)?;
        let (action, counter) = match entry {
            EntrySpec::Tcam(e) if target.is_tcam() => (e.action, e.counter),
            EntrySpec::Exact(e) if !target.is_tcam() => (e.action, e.counter),
            _ => return Err(DevStatus::InvalidArgument),
        };
        if target.entries.len() >= target.max_entries as usize {
            return Err(DevStatus::NoSpace);
        }
        if !self.actions.contains_key(&action.as_raw()) {
            return Err(DevStatus::NotFound);
        }
        if counter.is_some_and(|c| c.0 >= self.counters_total) {
            return Err(DevStatus::InvalidArgument);
        }

        let raw = self.alloc_handle();
        let handle = EntryHandle::from_raw_unchecked(raw);
        let record = match entry {
            EntrySpec::Tcam(e) => SimEntry::Tcam {
                table,
                entry: e.clone(),
            },
            EntrySpec::Exact(e) => SimEntry::Exact {
                table,
                entry: e.clone(),
            },
        };
        self.entries.insert(raw, record);
        if let Some(t) = self.tables.get_mut(&table.as_raw()) {
            t.entries.push(handle);
        }
        Ok(DevReply::Handle(raw))
    }

    fn execute(&mut self, cmd: DevCommand<'_>) -> Result<DevReply, DevStatus> {
        match cmd {
            DevCommand::TableAlloc {
                direction,
                max_entries,
                spec,
            } => {
                if max_entries == 0 {
                    return Err(DevStatus::InvalidArgument);
                }
                let key = match spec {
                    TableSpec::Tcam => None,
                    TableSpec::Exact { key } => Some(*key),
                };
                let raw = self.alloc_handle();
                self.tables.insert(
                    raw,
                    SimTable {
                        direction,
                        max_entries,
                        key,
                        entries: Vec::new(),
                    },
                );
                Ok(DevReply::Handle(raw))
            }
            DevCommand::TableFree { table } => {
                let held = self.tables.get(&table.as_raw()).ok_or(DevStatus::NotFound)?;
                if !held.entries.is_empty() {
                    return Err(DevStatus::Busy);
                }
                let referenced = self.actions.values().any(|program| {
                    program
                        .ops()
                        .iter()
                        .any(|op| matches!(op, ActionOp::ExactMatch { table: t } if *t == table))
                });
                if referenced {
                    return Err(DevStatus::Busy);
                }
                self.tables.remove(&table.as_raw());
                Ok(DevReply::Done)
            }
            DevCommand::EntryInstall { table, entry } => self.install(table, entry),
            DevCommand::EntryRemove { entry } => {
                let removed = self.entries.remove(&entry.as_raw()).ok_or(DevStatus::NotFound)?;
                if let Some(t) = self.tables.get_mut(&removed.table().as_raw()) {
                    t.entries.retain(|e| *e != entry);
                }
                Ok(DevReply::Done)
            }
            DevCommand::ActionAlloc { program } => {
                if !program.is_terminated() {
                    return Err(DevStatus::InvalidArgument);
                }
                if let Some(target) = program.jump_target() {
                    if !self.tables.contains_key(&target.as_raw()) {
                        return Err(DevStatus::NotFound);
                    }
                }
                let raw = self.alloc_handle();
                self.actions.insert(raw, program.clone());
                Ok(DevReply::Handle(raw))
            }
            DevCommand::ActionFree { action } => {
                if !self.actions.contains_key(&action.as_raw()) {
                    return Err(DevStatus::NotFound);
                }
                if self.entries.values().any(|e| e.action() == action) {
                    return Err(DevStatus::Busy);
                }
                self.actions.remove(&action.as_raw());
                Ok(DevReply::Done)
            }
            DevCommand::CounterAllocBlock { total } => {
                if self.counter_limit.is_some_and(|limit| total > limit) {
                    return Err(DevStatus::NoSpace);
                }
                self.counters_total = total;
                self.counter_values.retain(|id, _| *id < total);
                Ok(DevReply::Done)
            }
            DevCommand::CounterQuery { counter, reset } => {
                if counter.0 >= self.counters_total {
                    return Err(DevStatus::InvalidArgument);
                }
                let stats = if reset {
                    self.counter_values.remove(&counter.0)
                } else {
                    self.counter_values.get(&counter.0).copied()
                };
                Ok(DevReply::Counter(stats.unwrap_or_default()))
            }
            DevCommand::VnicFind { bdf } => self
                .vnics
                .get(&bdf)
                .map(|raw| DevReply::Handle(*raw))
                .ok_or(DevStatus::NotFound),
        }
    }
}

impl DeviceChannel for SimDevice {
    fn command(&mut self, cmd: DevCommand<'_>) -> DevResult<DevReply> {
        let opcode = cmd.opcode();
        self.history.push(opcode);
        if let Some(status) = self.take_failure(opcode) {
            return Err(DevError::status(opcode, status));
        }
        self.execute(cmd).map_err(|status| DevError::status(opcode, status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::FlowApi;
    use crate::encoding::EntryFlags;
    use pretty_assertions::assert_eq;

    fn drop_program() -> ActionProgram {
        let mut program = ActionProgram::new();
        program.push(ActionOp::Drop).unwrap();
        program.push(ActionOp::End).unwrap();
        program
    }

    #[test]
    fn test_entry_lifecycle() {
        let mut dev = SimDevice::new();
        let table = dev.tcam_table_alloc(Direction::Ingress, 2).unwrap();
        let action = dev.action_alloc(&drop_program()).unwrap();
        let entry = MatchEntry {
            action,
            ..MatchEntry::default()
        };

        let handle = dev.tcam_entry_install(table, &entry).unwrap();
        assert_eq!(dev.entries_in(table), 1);
        assert_eq!(dev.entry(handle).unwrap().action(), action);

        // In-use objects cannot be freed.
        assert!(dev.action_free(action).is_err());
        assert!(dev.table_free(table).is_err());

        dev.entry_remove(handle).unwrap();
        dev.action_free(action).unwrap();
        dev.table_free(table).unwrap();
        assert_eq!(dev.table_count(), 0);
        assert_eq!(dev.action_count(), 0);
    }

    #[test]
    fn test_entry_kind_must_match_table() {
        let mut dev = SimDevice::new();
        let key = KeyTemplate::default_key();
        let table = dev.exact_table_alloc(Direction::Egress, 4, &key).unwrap();
        let action = dev.action_alloc(&drop_program()).unwrap();
        let entry = MatchEntry {
            action,
            ..MatchEntry::default()
        };
        let err = dev.tcam_entry_install(table, &entry).unwrap_err();
        assert_eq!(err.device_status(), Some(DevStatus::InvalidArgument));

        dev.exact_entry_install(table, &ExactEntry::from(&entry)).unwrap();
        assert_eq!(dev.exact_table_count(), 1);
    }

    #[test]
    fn test_table_capacity() {
        let mut dev = SimDevice::new();
        let table = dev.tcam_table_alloc(Direction::Ingress, 1).unwrap();
        let action = dev.action_alloc(&drop_program()).unwrap();
        let entry = MatchEntry {
            action,
            ..MatchEntry::default()
        };
        dev.tcam_entry_install(table, &entry).unwrap();
        let err = dev.tcam_entry_install(table, &entry).unwrap_err();
        assert_eq!(err.device_status(), Some(DevStatus::NoSpace));
    }

    #[test]
    fn test_counters() {
        let mut dev = SimDevice::new().with_counter_limit(200);
        dev.counter_alloc_block(100).unwrap();
        dev.set_counter(
            CounterId(5),
            CounterStats {
                hits: 3,
                bytes: 180,
            },
        );
        let stats = dev.counter_query(CounterId(5), true).unwrap();
        assert_eq!(stats.hits, 3);
        assert_eq!(dev.counter_query(CounterId(5), false).unwrap(), CounterStats::default());
        assert!(dev.counter_query(CounterId(100), false).is_err());
        assert!(dev.counter_alloc_block(300).is_err());

        let action = dev.action_alloc(&drop_program()).unwrap();
        let table = dev.tcam_table_alloc(Direction::Ingress, 4).unwrap();
        let entry = MatchEntry {
            action,
            flags: EntryFlags::COUNTER,
            counter: Some(CounterId(150)),
            ..MatchEntry::default()
        };
        assert!(dev.tcam_entry_install(table, &entry).is_err());
    }

    #[test]
    fn test_planned_failure() {
        let mut dev = SimDevice::new();
        dev.fail_nth(Opcode::TableAlloc, 1, DevStatus::NoSpace);
        assert!(dev.tcam_table_alloc(Direction::Ingress, 8).is_ok());
        let err = dev.tcam_table_alloc(Direction::Egress, 8).unwrap_err();
        assert_eq!(err, DevError::status(Opcode::TableAlloc, DevStatus::NoSpace));
        assert!(dev.tcam_table_alloc(Direction::Egress, 8).is_ok());
        assert_eq!(dev.command_count(Opcode::TableAlloc), 3);
    }

    #[test]
    fn test_jump_target_must_exist() {
        let mut dev = SimDevice::new().with_vnic(0x0510, 0x77);
        let mut program = ActionProgram::new();
        program
            .push(ActionOp::ExactMatch {
                table: TableHandle::from_raw_unchecked(0x9999),
            })
            .unwrap();
        program.push(ActionOp::End).unwrap();
        assert!(dev.action_alloc(&program).is_err());
        assert_eq!(dev.vnic_find(0x0510).unwrap().as_raw(), 0x77);
        assert!(dev.vnic_find(0x0511).is_err());
    }
}
