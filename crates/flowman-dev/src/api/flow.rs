//! Typed wrappers for the flow manager commands.
//!
//! [`FlowApi`] is implemented for every [`DeviceChannel`], so callers get one
//! method per opcode with typed handles in and out instead of raw reply
//! words.

use log::debug;

use super::command::{DevCommand, DevReply, DeviceChannel, EntrySpec, Opcode, TableSpec};
use crate::encoding::{ActionProgram, ExactEntry, KeyTemplate, MatchEntry};
use crate::error::{DevError, DevResult};
use crate::types::{
    ActionHandle, CounterId, CounterStats, DevHandle, DevObjectKind, Direction, EntryHandle,
    TableHandle, VnicHandle,
};

fn expect_handle<T: DevObjectKind>(opcode: Opcode, reply: DevReply) -> DevResult<DevHandle<T>> {
    match reply {
        DevReply::Handle(raw) => DevHandle::from_raw(raw).ok_or(DevError::NullHandle { opcode }),
        _ => Err(DevError::UnexpectedReply { opcode }),
    }
}

fn expect_done(opcode: Opcode, reply: DevReply) -> DevResult<()> {
    match reply {
        DevReply::Done => Ok(()),
        _ => Err(DevError::UnexpectedReply { opcode }),
    }
}

/// Typed flow manager commands.
pub trait FlowApi: DeviceChannel {
    /// Allocates a group-0 TCAM table.
    fn tcam_table_alloc(&mut self, direction: Direction, max_entries: u32) -> DevResult<TableHandle> {
        let reply = self.command(DevCommand::TableAlloc {
            direction,
            max_entries,
            spec: TableSpec::Tcam,
        })?;
        let handle = expect_handle(Opcode::TableAlloc, reply)?;
        debug!("{} TCAM table allocated, handle={}", direction.tag(), handle);
        Ok(handle)
    }

    /// Allocates an exact-match table whose entries share `key`.
    fn exact_table_alloc(
        &mut self,
        direction: Direction,
        max_entries: u32,
        key: &KeyTemplate,
    ) -> DevResult<TableHandle> {
        let reply = self.command(DevCommand::TableAlloc {
            direction,
            max_entries,
            spec: TableSpec::Exact { key },
        })?;
        let handle = expect_handle(Opcode::TableAlloc, reply)?;
        debug!("{} exact match table allocated, handle={}", direction.tag(), handle);
        Ok(handle)
    }

    fn table_free(&mut self, table: TableHandle) -> DevResult<()> {
        let reply = self.command(DevCommand::TableFree { table })?;
        expect_done(Opcode::TableFree, reply)
    }

    fn tcam_entry_install(&mut self, table: TableHandle, entry: &MatchEntry) -> DevResult<EntryHandle> {
        let reply = self.command(DevCommand::EntryInstall {
            table,
            entry: EntrySpec::Tcam(entry),
        })?;
        expect_handle(Opcode::EntryInstall, reply)
    }

    fn exact_entry_install(&mut self, table: TableHandle, entry: &ExactEntry) -> DevResult<EntryHandle> {
        let reply = self.command(DevCommand::EntryInstall {
            table,
            entry: EntrySpec::Exact(entry),
        })?;
        expect_handle(Opcode::EntryInstall, reply)
    }

    fn entry_remove(&mut self, entry: EntryHandle) -> DevResult<()> {
        let reply = self.command(DevCommand::EntryRemove { entry })?;
        expect_done(Opcode::EntryRemove, reply)
    }

    fn action_alloc(&mut self, program: &ActionProgram) -> DevResult<ActionHandle> {
        let reply = self.command(DevCommand::ActionAlloc { program })?;
        expect_handle(Opcode::ActionAlloc, reply)
    }

    fn action_free(&mut self, action: ActionHandle) -> DevResult<()> {
        let reply = self.command(DevCommand::ActionFree { action })?;
        expect_done(Opcode::ActionFree, reply)
    }

    /// Grows (or with zero, releases) the device counter block to `total`.
    fn counter_alloc_block(&mut self, total: u32) -> DevResult<()> {
        let reply = self.command(DevCommand::CounterAllocBlock { total })?;
        expect_done(Opcode::CounterAllocBlock, reply)
    }

    fn counter_query(&mut self, counter: CounterId, reset: bool) -> DevResult<CounterStats> {
        match self.command(DevCommand::CounterQuery { counter, reset })? {
            DevReply::Counter(stats) => Ok(stats),
            _ => Err(DevError::UnexpectedReply {
                opcode: Opcode::CounterQuery,
            }),
        }
    }

    fn vnic_find(&mut self, bdf: u32) -> DevResult<VnicHandle> {
        let reply = self.command(DevCommand::VnicFind { bdf })?;
        expect_handle(Opcode::VnicFind, reply)
    }
}

impl<C: DeviceChannel + ?Sized> FlowApi for C {}
