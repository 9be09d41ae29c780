//! Device error types and status handling.
//!
//! Every flow manager command returns a raw status word. This module turns
//! those words into Rust's `Result` type and keeps the failing opcode
//! attached so callers can report which command was refused.

use std::fmt;
use thiserror::Error;

use crate::api::Opcode;

/// Status codes returned by the device command channel.
///
/// Zero is success; every other value aborts the caller's operation.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DevStatus {
    Success = 0,
    Failure = -1,
    NotSupported = -2,
    NoMemory = -3,
    NoSpace = -4,
    InvalidArgument = -5,
    NotFound = -6,
    Busy = -7,
    Timeout = -8,
}

impl DevStatus {
    /// Creates a DevStatus from a raw i32 value.
    ///
    /// Unknown non-zero values collapse to `Failure`.
    pub fn from_raw(status: i32) -> Self {
        match status {
            0 => DevStatus::Success,
            -2 => DevStatus::NotSupported,
            -3 => DevStatus::NoMemory,
            -4 => DevStatus::NoSpace,
            -5 => DevStatus::InvalidArgument,
            -6 => DevStatus::NotFound,
            -7 => DevStatus::Busy,
            -8 => DevStatus::Timeout,
            _ => DevStatus::Failure,
        }
    }

    /// Returns the raw status word.
    pub fn as_raw(self) -> i32 {
        self as i32
    }

    /// Returns true if the status indicates success.
    pub fn is_success(&self) -> bool {
        *self == DevStatus::Success
    }

    /// Converts to a Result for the given opcode, returning Ok(()) for success.
    pub fn into_result(self, opcode: Opcode) -> DevResult<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(DevError::Status {
                opcode,
                status: self,
            })
        }
    }
}

impl fmt::Display for DevStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DevStatus::Success => "FM_SUCCESS",
            DevStatus::Failure => "FM_FAILURE",
            DevStatus::NotSupported => "FM_NOT_SUPPORTED",
            DevStatus::NoMemory => "FM_NO_MEMORY",
            DevStatus::NoSpace => "FM_NO_SPACE",
            DevStatus::InvalidArgument => "FM_INVALID_ARGUMENT",
            DevStatus::NotFound => "FM_NOT_FOUND",
            DevStatus::Busy => "FM_BUSY",
            DevStatus::Timeout => "FM_TIMEOUT",
        };
        write!(f, "{}", s)
    }
}

/// Error type for device commands.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DevError {
    /// The device refused the command.
    #[error("{opcode} failed: {status} ({})", .status.as_raw())]
    Status { opcode: Opcode, status: DevStatus },

    /// The device answered with a reply that does not fit the command.
    #[error("{opcode} returned an unexpected reply")]
    UnexpectedReply { opcode: Opcode },

    /// The device reported success but handed back a null handle.
    #[error("{opcode} returned a null handle")]
    NullHandle { opcode: Opcode },
}

impl DevError {
    /// Creates a status error for an opcode.
    pub fn status(opcode: Opcode, status: DevStatus) -> Self {
        DevError::Status { opcode, status }
    }

    /// Returns the opcode of the failed command.
    pub fn opcode(&self) -> Opcode {
        match self {
            DevError::Status { opcode, .. }
            | DevError::UnexpectedReply { opcode }
            | DevError::NullHandle { opcode } => *opcode,
        }
    }

    /// Returns the device status if the device refused the command.
    pub fn device_status(&self) -> Option<DevStatus> {
        match self {
            DevError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns true if the device ran out of table or memory space.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(
            self.device_status(),
            Some(DevStatus::NoSpace) | Some(DevStatus::NoMemory)
        )
    }
}

/// Result type for device commands.
pub type DevResult<T> = Result<T, DevError>;
