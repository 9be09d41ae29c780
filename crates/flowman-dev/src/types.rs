//! Type-safe device handle wrappers.
//!
//! The device hands out opaque 64-bit handles for tables, entries, action
//! objects and vNICs. Wrapping them in distinct types prevents passing an
//! entry handle where a table handle is expected.

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::str::FromStr;

/// Raw device handle (matches the 64-bit result word of the command channel).
pub type RawHandle = u64;

/// Marker trait for device object kinds.
pub trait DevObjectKind: Send + Sync + 'static {
    /// Returns the object type name for debugging.
    fn type_name() -> &'static str;
}

/// A type-safe device handle.
///
/// The phantom type parameter `T` indicates what kind of device object the
/// handle refers to. Zero is the null handle.
#[derive(Clone, Copy)]
pub struct DevHandle<T: DevObjectKind> {
    raw: RawHandle,
    _marker: PhantomData<T>,
}

impl<T: DevObjectKind> DevHandle<T> {
    /// The null handle.
    pub const NULL: Self = Self {
        raw: 0,
        _marker: PhantomData,
    };

    /// Creates a handle from a raw value.
    ///
    /// Returns `None` if the raw value is 0.
    pub fn from_raw(raw: RawHandle) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self {
                raw,
                _marker: PhantomData,
            })
        }
    }

    /// Creates a handle from a raw value, including null.
    pub const fn from_raw_unchecked(raw: RawHandle) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// Returns the raw handle value.
    pub const fn as_raw(&self) -> RawHandle {
        self.raw
    }

    /// Returns true if this is the null handle.
    pub const fn is_null(&self) -> bool {
        self.raw == 0
    }

    /// Returns true if this is a valid (non-null) handle.
    pub const fn is_valid(&self) -> bool {
        self.raw != 0
    }
}

impl<T: DevObjectKind> fmt::Debug for DevHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:x})", T::type_name(), self.raw)
    }
}

impl<T: DevObjectKind> fmt::Display for DevHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.raw)
    }
}

impl<T: DevObjectKind> PartialEq for DevHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T: DevObjectKind> Eq for DevHandle<T> {}

impl<T: DevObjectKind> Hash for DevHandle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T: DevObjectKind> Default for DevHandle<T> {
    fn default() -> Self {
        Self::NULL
    }
}

macro_rules! define_object_kind {
    ($name:ident, $type_name:literal, $handle_alias:ident) => {
        #[doc = concat!("Marker type for device ", $type_name, " objects.")]
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl DevObjectKind for $name {
            fn type_name() -> &'static str {
                $type_name
            }
        }

        #[doc = concat!("Handle of a device ", $type_name, " object.")]
        pub type $handle_alias = DevHandle<$name>;
    };
}

define_object_kind!(TableKind, "Table", TableHandle);
define_object_kind!(EntryKind, "Entry", EntryHandle);
define_object_kind!(ActionKind, "Action", ActionHandle);
define_object_kind!(VnicKind, "Vnic", VnicHandle);

/// Index of a device counter.
///
/// Counters are allocated as a contiguous block growing from zero, so zero is
/// a perfectly valid counter and there is no null value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterId(pub u32);

impl fmt::Display for CounterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctr{}", self.0)
    }
}

/// Hit and byte totals read from a counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterStats {
    pub hits: u64,
    pub bytes: u64,
}

/// Traffic direction a table or rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    /// Both directions, ingress first.
    pub const ALL: [Direction; 2] = [Direction::Ingress, Direction::Egress];

    /// Returns a dense index usable for per-direction arrays.
    pub const fn index(self) -> usize {
        match self {
            Direction::Ingress => 0,
            Direction::Egress => 1,
        }
    }

    /// Short tag used in log lines.
    pub const fn tag(self) -> &'static str {
        match self {
            Direction::Ingress => "IG",
            Direction::Egress => "EG",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ingress" | "ig" => Ok(Direction::Ingress),
            "egress" | "eg" => Ok(Direction::Egress),
            _ => Err(format!("Unknown direction: {}", s)),
        }
    }
}
