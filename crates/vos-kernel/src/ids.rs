//! Typed kernel and vat-local identifiers with their persisted string forms.
//!
//! Kernel-space: `v3` (vat), `ko42` (object), `kp40` (promise). Vat-space
//! slots carry an allocation side: `o+N` / `p+N` were allocated by the vat
//! (exports), `o-N` / `p-N` by the kernel (imports).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid identifier '{value}': expected {expected}")]
pub struct IdParseError {
    pub value: String,
    pub expected: &'static str,
}

fn parse_suffix(value: &str, prefix: &str, expected: &'static str) -> Result<u64, IdParseError> {
    value
        .strip_prefix(prefix)
        .and_then(|rest| rest.parse().ok())
        .ok_or_else(|| IdParseError {
            value: value.to_string(),
            expected,
        })
}

macro_rules! prefixed_id {
    ($name:ident, $prefix:literal, $expected:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;
            fn from_str(value: &str) -> Result<Self, Self::Err> {
                parse_suffix(value, $prefix, $expected).map($name)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let text = String::deserialize(deserializer)?;
                text.parse().map_err(de::Error::custom)
            }
        }
    };
}

prefixed_id!(VatId, "v", "v<N>");
prefixed_id!(KObjectId, "ko", "ko<N>");
prefixed_id!(KPromiseId, "kp", "kp<N>");
prefixed_id!(MeterId, "m", "m<N>");

/// A kernel-space capability reference: either an object or a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KernelSlot {
    Object(KObjectId),
    Promise(KPromiseId),
}

impl KernelSlot {
    pub fn as_object(&self) -> Option<KObjectId> {
        match self {
            KernelSlot::Object(id) => Some(*id),
            KernelSlot::Promise(_) => None,
        }
    }

    pub fn as_promise(&self) -> Option<KPromiseId> {
        match self {
            KernelSlot::Promise(id) => Some(*id),
            KernelSlot::Object(_) => None,
        }
    }
}

impl From<KObjectId> for KernelSlot {
    fn from(id: KObjectId) -> Self {
        KernelSlot::Object(id)
    }
}

impl From<KPromiseId> for KernelSlot {
    fn from(id: KPromiseId) -> Self {
        KernelSlot::Promise(id)
    }
}

impl fmt::Display for KernelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelSlot::Object(id) => id.fmt(f),
            KernelSlot::Promise(id) => id.fmt(f),
        }
    }
}

impl FromStr for KernelSlot {
    type Err = IdParseError;
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.starts_with("ko") {
            value.parse().map(KernelSlot::Object)
        } else if value.starts_with("kp") {
            value.parse().map(KernelSlot::Promise)
        } else {
            Err(IdParseError {
                value: value.to_string(),
                expected: "ko<N> or kp<N>",
            })
        }
    }
}

impl Serialize for KernelSlot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for KernelSlot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VatSlotKind {
    Object,
    Promise,
}

/// A vat-local capability reference as seen inside one vat's c-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VatSlot {
    pub kind: VatSlotKind,
    /// True when the vat allocated the slot itself (`+` forms, i.e. exports).
    pub allocated_by_vat: bool,
    pub index: u64,
}

impl VatSlot {
    pub fn export(kind: VatSlotKind, index: u64) -> Self {
        Self {
            kind,
            allocated_by_vat: true,
            index,
        }
    }

    pub fn import(kind: VatSlotKind, index: u64) -> Self {
        Self {
            kind,
            allocated_by_vat: false,
            index,
        }
    }
}

impl fmt::Display for VatSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            VatSlotKind::Object => 'o',
            VatSlotKind::Promise => 'p',
        };
        let side = if self.allocated_by_vat { '+' } else { '-' };
        write!(f, "{kind}{side}{}", self.index)
    }
}

impl FromStr for VatSlot {
    type Err = IdParseError;
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let bad = || IdParseError {
            value: value.to_string(),
            expected: "o+N, o-N, p+N or p-N",
        };
        let mut chars = value.chars();
        let kind = match chars.next() {
            Some('o') => VatSlotKind::Object,
            Some('p') => VatSlotKind::Promise,
            _ => return Err(bad()),
        };
        let allocated_by_vat = match chars.next() {
            Some('+') => true,
            Some('-') => false,
            _ => return Err(bad()),
        };
        let index = chars.as_str().parse().map_err(|_| bad())?;
        Ok(Self {
            kind,
            allocated_by_vat,
            index,
        })
    }
}

impl Serialize for VatSlot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for VatSlot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}
