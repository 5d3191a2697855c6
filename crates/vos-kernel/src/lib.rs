//! Deterministic vat kernel: durable object/promise tables, per-vat c-lists,
//! crank-at-a-time scheduling, and reference-count driven garbage collection.

pub mod config;
pub mod controller;
pub mod error;
pub mod gc;
pub mod ids;
pub mod keeper;
pub mod records;
pub mod syscall;
pub mod warehouse;

pub use config::KernelConfig;
pub use controller::{AdmissionPolicy, AdmitAll, Admission, Controller};
pub use error::KernelError;
pub use gc::{GcAction, GcActionKind};
pub use ids::{KObjectId, KPromiseId, KernelSlot, MeterId, VatId, VatSlot, VatSlotKind};
pub use keeper::{KernelKeeper, MeterVerdict, VatKeeper};
pub use records::{
    CapData, DeliveryStatus, ManagerType, Message, MeterRecord, PromiseState, RunQueueItem,
    SnapshotRecord, SyscallRecord, TranscriptEntry, VatCapData, VatDelivery, VatOptions,
    VatRecord, VatResolution,
};
pub use syscall::{SyscallResult, VatSyscall};
pub use warehouse::{
    ProcessWorker, ProcessWorkerFactory, SyscallSink, VatWarehouse, VatWorker, WorkerFactory,
};
