//! Flow manager error types.

use flowman_dev::{DevError, Direction};
use thiserror::Error;

use crate::types::FlowId;

/// Errors surfaced by the flow manager.
///
/// Compiler errors (`UnsupportedItem` through `InvalidAttr`) are raised
/// before any device resource is allocated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    #[error("Unsupported item: {0}")]
    UnsupportedItem(String),

    #[error("Invalid item stacking: {0}")]
    InvalidStacking(String),

    #[error("Unsupported action: {0}")]
    UnsupportedAction(String),

    #[error("Invalid action combination: {0}")]
    InvalidActionCombination(String),

    #[error("Invalid flow attribute: {0}")]
    InvalidAttr(String),

    /// The rule's mask differs from the key template its group was opened with.
    #[error("Key does not match the {direction} table of group {group}")]
    KeyMismatch { group: u32, direction: Direction },

    #[error("Cannot get exact match table for group {group} ({direction})")]
    TableResourceExhausted {
        group: u32,
        direction: Direction,
        #[source]
        source: Option<DevError>,
    },

    #[error("Device command failed: {0}")]
    DeviceCommandFailed(#[from] DevError),

    #[error("Counter pool exhausted after {allocated} counters")]
    CounterResourceExhausted {
        allocated: u32,
        #[source]
        source: Option<DevError>,
    },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Flow not found: {0}")]
    FlowNotFound(FlowId),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl FlowError {
    /// Returns true for errors raised by the compilers, which never hold
    /// device resources.
    pub fn is_compile_error(&self) -> bool {
        matches!(
            self,
            FlowError::UnsupportedItem(_)
                | FlowError::InvalidStacking(_)
                | FlowError::UnsupportedAction(_)
                | FlowError::InvalidActionCombination(_)
                | FlowError::InvalidAttr(_)
        )
    }
}

/// Result type for flow manager operations.
pub type Result<T> = std::result::Result<T, FlowError>;
