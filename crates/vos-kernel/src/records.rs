//! Persisted record types. Everything in this module is CBOR-encoded into
//! the durable store or onto the worker wire, so fields use stable names and
//! `serde_bytes` for raw payloads.

use serde::{Deserialize, Serialize};

use crate::gc::GcAction;
use crate::ids::{KPromiseId, KernelSlot, MeterId, VatId, VatSlot};

/// Capability-bearing data in kernel space: an opaque serialized body plus
/// the kernel slots it references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapData {
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub slots: Vec<KernelSlot>,
}

impl CapData {
    pub fn new(body: impl Into<Vec<u8>>, slots: Vec<KernelSlot>) -> Self {
        Self {
            body: body.into(),
            slots,
        }
    }

    /// A resolution whose entire value is one capability reference. Messages
    /// queued against a promise resolved this way forward to the slot.
    pub fn slot_ref(slot: KernelSlot) -> Self {
        Self {
            body: b"$0".to_vec(),
            slots: vec![slot],
        }
    }

    pub fn as_slot_ref(&self) -> Option<KernelSlot> {
        if self.body == b"$0" && self.slots.len() == 1 {
            Some(self.slots[0])
        } else {
            None
        }
    }
}

/// Same shape as [`CapData`] but in one vat's local slot space, ready for a
/// worker delivery or fresh from a worker syscall.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatCapData {
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub slots: Vec<VatSlot>,
}

/// One queued application message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub method: String,
    pub args: CapData,
    /// Promise that receives the delivery's result, if the sender wants one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<KPromiseId>,
}

/// Ordered unit of kernel work. Run-queue and acceptance-queue entries share
/// this shape; GC work rides the same queue at lower scheduling priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunQueueItem {
    Send {
        target: KernelSlot,
        message: Message,
    },
    Notify {
        vat: VatId,
        promise: KPromiseId,
    },
    Gc {
        action: GcAction,
    },
    BringOutYourDead {
        vat: VatId,
    },
}

/// Promise table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PromiseState {
    Unresolved {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        decider: Option<VatId>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        subscribers: Vec<VatId>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        queue: Vec<Message>,
    },
    Fulfilled {
        data: CapData,
    },
    Rejected {
        data: CapData,
    },
}

impl PromiseState {
    pub fn new_unresolved(decider: Option<VatId>) -> Self {
        PromiseState::Unresolved {
            decider,
            subscribers: Vec::new(),
            queue: Vec::new(),
        }
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self, PromiseState::Unresolved { .. })
    }
}

/// How a vat's worker is hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ManagerType {
    /// Worker supplied in-process by the embedder (tests, bootstrap vats).
    #[default]
    Local,
    /// Out-of-process worker driven over the supervisor wire protocol.
    Subprocess,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VatOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meter: Option<MeterId>,
    /// Deliveries between forced GC sweeps for this vat; `None` uses the
    /// kernel-wide default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reap_interval: Option<u64>,
    /// Worker manager for this vat; `None` uses the kernel-wide default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager: Option<ManagerType>,
}

/// Vat registry entry. Static vats live for the kernel's lifetime; dynamic
/// vats come and go, keeping their identity across upgrades while the
/// incarnation number advances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub options: VatOptions,
    pub is_alive: bool,
    pub incarnation: u32,
    pub is_dynamic: bool,
}

/// One delivery as the target vat's worker sees it, fully translated into
/// that vat's slot space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VatDelivery {
    Message {
        target: VatSlot,
        method: String,
        args: VatCapData,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<VatSlot>,
    },
    Notify {
        resolutions: Vec<VatResolution>,
    },
    DropExports {
        slots: Vec<VatSlot>,
    },
    RetireExports {
        slots: Vec<VatSlot>,
    },
    RetireImports {
        slots: Vec<VatSlot>,
    },
    /// Forced GC pass: the vat reports which of its imports it no longer
    /// reaches.
    BringOutYourDead,
    StartVat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatResolution {
    pub promise: VatSlot,
    pub rejected: bool,
    pub data: VatCapData,
}

/// Terminal status of one delivery, as reported by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Ok,
    Fail { detail: String },
}

impl DeliveryStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, DeliveryStatus::Ok)
    }
}

/// One recorded worker syscall exchange, kept for deterministic replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallRecord {
    #[serde(with = "serde_bytes")]
    pub request: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub response: Vec<u8>,
}

/// One transcript entry: the delivery, every syscall it made, and how it
/// settled. Replaying the span from the last snapshot must reproduce the
/// syscall stream byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub delivery: VatDelivery,
    pub syscalls: Vec<SyscallRecord>,
    pub result: DeliveryStatus,
}

/// Record of the most recent worker snapshot for a vat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Where the worker wrote its heap snapshot.
    pub path: String,
    /// Transcript position the snapshot covers; replay resumes after it.
    pub up_to_position: u64,
    pub incarnation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterRecord {
    pub remaining: u64,
    pub threshold: u64,
}
