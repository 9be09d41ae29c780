//! Safe wrappers for the device command channel.
//!
//! - [`command`]: the raw [`DeviceChannel`] seam, opcodes and replies
//! - [`flow`]: [`FlowApi`], one typed method per opcode

pub mod command;
pub mod flow;

pub use command::{DevCommand, DevReply, DeviceChannel, EntrySpec, Opcode, TableSpec};
pub use flow::FlowApi;
