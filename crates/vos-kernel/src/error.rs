use thiserror::Error;

use crate::ids::{IdParseError, KObjectId, KPromiseId, VatId};

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("store error: {0}")]
    Store(#[from] vos_store::StoreError),
    #[error("serialization error: {0}")]
    Codec(#[from] serde_cbor::Error),
    #[error("corrupt kernel state: {0}")]
    Corrupt(String),
    #[error("unknown vat {0}")]
    UnknownVat(VatId),
    #[error("vat {0} is not alive")]
    VatNotAlive(VatId),
    #[error("unknown kernel object {0}")]
    UnknownObject(KObjectId),
    #[error("unknown kernel promise {0}")]
    UnknownPromise(KPromiseId),
    #[error("vat {vat} is not the decider of {promise}")]
    NotDecider { vat: VatId, promise: KPromiseId },
    #[error("promise {0} is already resolved")]
    AlreadyResolved(KPromiseId),
    #[error("refcount underflow on {kref}: {detail}")]
    RefCountUnderflow { kref: String, detail: String },
    #[error("vat {vat} has no c-list entry for {slot}")]
    ClistMissing { vat: VatId, slot: String },
    #[error("replay divergence in {vat} delivery {delivery}: {detail}")]
    ReplayDivergence {
        vat: VatId,
        delivery: u64,
        detail: String,
    },
    #[error("worker fault for {vat}: {source}")]
    Worker {
        vat: VatId,
        #[source]
        source: vos_worker::WorkerError,
    },
    #[error("vat {vat} failed its start delivery: {detail}")]
    StartFailed { vat: VatId, detail: String },
    #[error("unknown meter {0}")]
    UnknownMeter(String),
}

impl From<IdParseError> for KernelError {
    fn from(err: IdParseError) -> Self {
        KernelError::Corrupt(err.to_string())
    }
}

impl KernelError {
    /// Consistency faults (broken kernel-state invariants) must halt the
    /// kernel cleanly; everything else is absorbed per-crank or per-vat.
    pub fn is_fatal(&self) -> bool {
        match self {
            KernelError::Store(err) => err.is_fatal(),
            KernelError::RefCountUnderflow { .. }
            | KernelError::ReplayDivergence { .. }
            | KernelError::Corrupt(_) => true,
            _ => false,
        }
    }
}
