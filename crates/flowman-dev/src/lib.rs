//! Safe Rust bindings for the NIC flow manager command channel.
//!
//! The flow manager firmware is driven through one synchronous command
//! channel. This crate gives that channel a typed surface so the layers above
//! never juggle raw argument words.
//!
//! # Architecture
//!
//! - [`types`]: type-safe device handles, counters and directions
//! - [`error`]: device status codes and error handling
//! - [`encoding`]: match keys, entries, key templates and action programs in
//!   the shape the device consumes
//! - [`api`]: the [`DeviceChannel`] seam and the typed [`FlowApi`] wrappers
//! - `sim` (feature `sim`): an in-memory device for tests
//!
//! # Example
//!
//! ```ignore
//! use flowman_dev::{Direction, FlowApi, DevResult, TableHandle};
//!
//! fn bring_up(dev: &mut impl FlowApi) -> DevResult<TableHandle> {
//!     dev.counter_alloc_block(100)?;
//!     dev.tcam_table_alloc(Direction::Ingress, 1024)
//! }
//! ```

pub mod api;
pub mod encoding;
pub mod error;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod types;

pub use api::{DevCommand, DevReply, DeviceChannel, EntrySpec, FlowApi, Opcode, TableSpec};
pub use encoding::{
    ActionOp, ActionProgram, EntryFlags, EthFields, ExactEntry, HeaderSelect, HeaderSet,
    Ipv4Fields, Ipv6Fields, KeyTemplate, L4Ports, L4Raw, MatchEntry, MatchKey, Metadata,
    ProgramFull, TcpFields, VlanFields, VxlanFields, ACTION_DATA_SIZE, ACTION_OP_MAX,
    HDRSET_MAX, LAYER_SIZE, MAGIC_FILTER_ID,
};
pub use error::{DevError, DevResult, DevStatus};
pub use types::{
    ActionHandle, ActionKind, CounterId, CounterStats, DevHandle, DevObjectKind, Direction,
    EntryHandle, EntryKind, RawHandle, TableHandle, TableKind, VnicHandle, VnicKind,
};
