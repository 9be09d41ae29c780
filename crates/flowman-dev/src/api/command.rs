//! The raw command channel.
//!
//! Every interaction with the flow manager firmware is one synchronous
//! command: an opcode with its arguments goes in, a status plus result words
//! come back. [`DeviceChannel`] is that single seam.

use std::fmt;

use crate::encoding::{ActionProgram, ExactEntry, KeyTemplate, MatchEntry};
use crate::error::DevResult;
use crate::types::{
    ActionHandle, CounterId, CounterStats, Direction, EntryHandle, RawHandle, TableHandle,
};

/// Command opcodes understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    TableAlloc,
    TableFree,
    EntryInstall,
    EntryRemove,
    ActionAlloc,
    ActionFree,
    CounterAllocBlock,
    CounterQuery,
    VnicFind,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Opcode::TableAlloc => "TABLE_ALLOC",
            Opcode::TableFree => "TABLE_FREE",
            Opcode::EntryInstall => "ENTRY_INSTALL",
            Opcode::EntryRemove => "ENTRY_REMOVE",
            Opcode::ActionAlloc => "ACTION_ALLOC",
            Opcode::ActionFree => "ACTION_FREE",
            Opcode::CounterAllocBlock => "COUNTER_ALLOC_BLOCK",
            Opcode::CounterQuery => "COUNTER_QUERY",
            Opcode::VnicFind => "VNIC_FIND",
        };
        write!(f, "{}", s)
    }
}

/// Shape of a table requested with TABLE_ALLOC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableSpec<'a> {
    /// Ternary table with per-entry masks and priorities.
    Tcam,
    /// Hash table whose entries all share `key`.
    Exact { key: &'a KeyTemplate },
}

/// Entry handed to ENTRY_INSTALL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrySpec<'a> {
    Tcam(&'a MatchEntry),
    Exact(&'a ExactEntry),
}

/// One device command with its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevCommand<'a> {
    TableAlloc {
        direction: Direction,
        max_entries: u32,
        spec: TableSpec<'a>,
    },
    TableFree {
        table: TableHandle,
    },
    EntryInstall {
        table: TableHandle,
        entry: EntrySpec<'a>,
    },
    EntryRemove {
        entry: EntryHandle,
    },
    ActionAlloc {
        program: &'a ActionProgram,
    },
    ActionFree {
        action: ActionHandle,
    },
    /// Sets the total number of allocated counters to `total`. Counters
    /// `0..total` become usable; zero releases them all.
    CounterAllocBlock {
        total: u32,
    },
    CounterQuery {
        counter: CounterId,
        reset: bool,
    },
    /// Looks up the vNIC at a PCI bus/device/function address.
    VnicFind {
        bdf: u32,
    },
}

impl DevCommand<'_> {
    pub fn opcode(&self) -> Opcode {
        match self {
            DevCommand::TableAlloc { .. } => Opcode::TableAlloc,
            DevCommand::TableFree { .. } => Opcode::TableFree,
            DevCommand::EntryInstall { .. } => Opcode::EntryInstall,
            DevCommand::EntryRemove { .. } => Opcode::EntryRemove,
            DevCommand::ActionAlloc { .. } => Opcode::ActionAlloc,
            DevCommand::ActionFree { .. } => Opcode::ActionFree,
            DevCommand::CounterAllocBlock { .. } => Opcode::CounterAllocBlock,
            DevCommand::CounterQuery { .. } => Opcode::CounterQuery,
            DevCommand::VnicFind { .. } => Opcode::VnicFind,
        }
    }
}

/// Result words of a successful command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevReply {
    Done,
    Handle(RawHandle),
    Counter(CounterStats),
}

/// The device command channel.
///
/// Implementations block until the device answers. A non-success status is
/// reported as `Err`; timeouts are the implementation's responsibility.
pub trait DeviceChannel {
    fn command(&mut self, cmd: DevCommand<'_>) -> DevResult<DevReply>;
}

impl<C: DeviceChannel + ?Sized> DeviceChannel for &mut C {
    fn command(&mut self, cmd: DevCommand<'_>) -> DevResult<DevReply> {
        (**self).command(cmd)
    }
}

impl<C: DeviceChannel + ?Sized> DeviceChannel for Box<C> {
    fn command(&mut self, cmd: DevCommand<'_>) -> DevResult<DevReply> {
        (**self).command(cmd)
    }
}
