//! Transactional key/value substrate with crank-granular commit and
//! savepoint rollback, plus SQLite and in-memory backends.

mod mem_store;
mod sqlite_store;

pub use mem_store::MemStore;
pub use sqlite_store::SqliteStore;

use std::{io, path::PathBuf};

pub type StoreResult<T> = Result<T, StoreError>;

/// Opaque marker into the write stream of the currently open crank.
/// `rollback_to` discards every write made after the marker while keeping
/// writes made before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Savepoint {
    pub(crate) crank: u64,
    pub(crate) index: usize,
}

/// Trait implemented by all durable-store backends.
///
/// All writes between `begin_crank` and `commit_crank` form one atomic unit;
/// `abort_crank` discards the whole unit. Reads inside an open crank observe
/// that crank's own writes.
pub trait DurableStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;
    fn set(&mut self, key: &str, value: &[u8]) -> StoreResult<()>;
    fn delete(&mut self, key: &str) -> StoreResult<()>;

    /// Returns every key starting with `prefix`, in ascending lexical order.
    fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    fn begin_crank(&mut self) -> StoreResult<()>;
    fn savepoint(&mut self) -> StoreResult<Savepoint>;
    fn rollback_to(&mut self, savepoint: Savepoint) -> StoreResult<()>;
    fn commit_crank(&mut self) -> StoreResult<()>;
    fn abort_crank(&mut self) -> StoreResult<()>;

    fn has(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("no crank transaction is open")]
    NoCrankOpen,
    #[error("a crank transaction is already open")]
    CrankAlreadyOpen,
    #[error("invalid savepoint: {0}")]
    InvalidSavepoint(String),
}

impl StoreError {
    /// Savepoint misuse is a kernel invariant violation, not an operational
    /// condition; callers treat it as unrecoverable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::InvalidSavepoint(_))
    }
}

/// Smallest key strictly greater than every key carrying `prefix`, used to
/// turn a prefix scan into a half-open range scan. Returns `None` when the
/// prefix is all 0xFF bytes (no upper bound exists).
pub(crate) fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut bytes = prefix.as_bytes().to_vec();
    while let Some(last) = bytes.last_mut() {
        if *last < 0xFF {
            *last += 1;
            // Keys in the kernel namespace are ASCII, so the bumped byte
            // stays valid UTF-8.
            return String::from_utf8(bytes).ok();
        }
        bytes.pop();
    }
    None
}
