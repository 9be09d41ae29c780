//! Rule-facing identifiers and attributes.

use std::fmt;
use std::str::FromStr;

use flowman_dev::Direction;
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Group served by the fixed TCAM tables.
pub const TCAM_GROUP: u32 = 0;

/// Handle of a flow owned by a [`FlowManager`](crate::FlowManager).
///
/// Ids are never reused, so a stale handle can never alias a newer flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(pub u64);

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flow#{}", self.0)
    }
}

/// Installation state of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowState {
    /// No device entry. Either not installed yet, or a jump conversion
    /// failed and released the entry.
    Uninstalled,
    Installed,
    /// Released. Destroyed flows are no longer tracked; see
    /// `FlowManager::flow_state`.
    Destroyed,
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlowState::Uninstalled => "uninstalled",
            FlowState::Installed => "installed",
            FlowState::Destroyed => "destroyed",
        };
        write!(f, "{}", s)
    }
}

/// Rule attributes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowAttr {
    pub group: u32,
    pub priority: u32,
    pub ingress: bool,
    pub egress: bool,
    pub transfer: bool,
}

impl FlowAttr {
    pub fn ingress(group: u32) -> Self {
        Self {
            group,
            ingress: true,
            ..Self::default()
        }
    }

    pub fn egress(group: u32) -> Self {
        Self {
            group,
            egress: true,
            ..Self::default()
        }
    }

    /// Checks the attributes and returns the rule's direction.
    ///
    /// A rule that names neither direction is an egress rule.
    pub fn validate(&self) -> Result<Direction> {
        if self.ingress && self.egress {
            return Err(FlowError::InvalidAttr(
                "ingress and egress at the same time".to_string(),
            ));
        }
        if self.transfer {
            return Err(FlowError::InvalidAttr("transfer is not supported".to_string()));
        }
        if self.priority != 0 {
            return Err(FlowError::InvalidAttr(format!(
                "priority {} is not supported",
                self.priority
            )));
        }
        Ok(if self.ingress {
            Direction::Ingress
        } else {
            Direction::Egress
        })
    }
}

/// PCI address of a peer port, `[dddd:]bb:dd.f`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    /// Bus/device/function packed the way VNIC_FIND expects it.
    pub fn bdf(&self) -> u32 {
        (u32::from(self.bus) << 8) | (u32::from(self.device) << 3) | u32::from(self.function)
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

impl FromStr for PciAddress {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bad = || format!("Invalid PCI address: {}", s);
        let (slot, function) = s.rsplit_once('.').ok_or_else(bad)?;
        let mut parts: Vec<&str> = slot.split(':').collect();
        let domain = match parts.len() {
            3 => u16::from_str_radix(parts.remove(0), 16).map_err(|_| bad())?,
            2 => 0,
            _ => return Err(bad()),
        };
        let bus = u8::from_str_radix(parts[0], 16).map_err(|_| bad())?;
        let device = u8::from_str_radix(parts[1], 16).map_err(|_| bad())?;
        let function = u8::from_str_radix(function, 16).map_err(|_| bad())?;
        if device > 0x1f || function > 7 {
            return Err(bad());
        }
        Ok(PciAddress {
            domain,
            bus,
            device,
            function,
        })
    }
}

impl TryFrom<String> for PciAddress {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PciAddress> for String {
    fn from(addr: PciAddress) -> Self {
        addr.to_string()
    }
}
