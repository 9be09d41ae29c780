//! Flow manager for a NIC with a two-level packet classifier.
//!
//! Rules are a match pattern plus an action list, organized in numbered
//! groups. Group 0 lives in one TCAM table per direction; every other group
//! maps to an exact-match table that is allocated when its first rule
//! arrives and freed when its last reference goes away. Group-0 rules reach
//! other groups through JUMP.
//!
//! # Architecture
//!
//! ```text
//! create(attr, pattern, actions)
//!        │
//!        ▼
//!    compiler ──> MatchEntry + ActionProgram
//!        │
//!        ▼
//!    FlowManager
//!        │
//!        ├──> TableRegistry (TCAM, default and per-group tables)
//!        ├──> CounterPool (COUNT)
//!        ├──> JumpResolver (JUMP to a group without a table yet)
//!        └──> DeviceChannel (flowman-dev)
//! ```
//!
//! A JUMP to a group that has no table yet is installed against the
//! per-direction default table. When a later rule creates the group's
//! table, the parked rules are reinstalled to jump there.
//!
//! # Key Components
//!
//! - [`FlowManager`]: owns all state and implements create, destroy, flush,
//!   query and validate
//! - [`TableRegistry`]: reference-counted exact-match tables
//! - [`CounterPool`]: growable free list of device counters
//! - [`JumpResolver`]: rules waiting for their jump target
//! - [`compiler`]: pattern and action compilers
//!
//! # Example
//!
//! ```ignore
//! use flowman::{FlowAction, FlowAttr, FlowItem, FlowManager, FlowManagerConfig};
//!
//! let mut fm = FlowManager::new(FlowManagerConfig::default(), device)?;
//! let flow = fm.create(
//!     &FlowAttr::ingress(0),
//!     &[FlowItem::eth(), FlowItem::ipv4()],
//!     &[FlowAction::Queue { index: 1 }],
//! )?;
//! fm.destroy(flow)?;
//! ```

pub mod action;
pub mod compiler;
pub mod config;
pub mod counter;
pub mod error;
pub mod item;
pub mod jump;
pub mod manager;
pub mod table;
pub mod types;

pub use action::{ActionType, FlowAction, RssConf, RssFunction};
pub use compiler::{compile, ActionContext, CompiledFlow, VnicResolver};
pub use config::{ConfigError, FlowManagerConfig};
pub use counter::CounterPool;
pub use error::{FlowError, Result};
pub use item::{
    EthSpec, FlowItem, ItemSpec, ItemType, Ipv4Spec, Ipv6Spec, RawSpec, SctpSpec, TcpSpec,
    UdpSpec, VlanSpec, VxlanSpec,
};
pub use jump::{JumpConversion, JumpFlow, JumpResolver};
pub use manager::{FlowManager, FlowManagerStats, FlowRule};
pub use table::{Fet, FetId, TableRegistry};
pub use types::{FlowAttr, FlowId, FlowState, PciAddress, TCAM_GROUP};
