use std::collections::BTreeMap;

use crate::{DurableStore, Savepoint, StoreError, StoreResult, prefix_upper_bound};

/// One reversible mutation recorded while a crank is open.
#[derive(Debug, Clone)]
struct UndoOp {
    key: String,
    prior: Option<Vec<u8>>,
}

/// In-memory store useful for unit tests and kernel scenarios that do not
/// need durability. Writes apply directly to the map; an undo log makes
/// savepoint rollback and crank aborts exact inverses.
#[derive(Debug, Default)]
pub struct MemStore {
    data: BTreeMap<String, Vec<u8>>,
    undo: Vec<UndoOp>,
    crank_open: bool,
    crank_counter: u64,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the committed contents, for test assertions.
    pub fn dump(&self) -> BTreeMap<String, Vec<u8>> {
        self.data.clone()
    }

    fn record(&mut self, key: &str) {
        if self.crank_open {
            self.undo.push(UndoOp {
                key: key.to_string(),
                prior: self.data.get(key).cloned(),
            });
        }
    }

    fn unwind_to(&mut self, index: usize) {
        while self.undo.len() > index {
            let Some(op) = self.undo.pop() else { break };
            match op.prior {
                Some(value) => {
                    self.data.insert(op.key, value);
                }
                None => {
                    self.data.remove(&op.key);
                }
            }
        }
    }
}

impl DurableStore for MemStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.record(key);
        self.data.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> StoreResult<()> {
        self.record(key);
        self.data.remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let keys = match prefix_upper_bound(prefix) {
            Some(upper) => self
                .data
                .range(prefix.to_string()..upper)
                .map(|(k, _)| k.clone())
                .collect(),
            None => self
                .data
                .range(prefix.to_string()..)
                .map(|(k, _)| k.clone())
                .collect(),
        };
        Ok(keys)
    }

    fn begin_crank(&mut self) -> StoreResult<()> {
        if self.crank_open {
            return Err(StoreError::CrankAlreadyOpen);
        }
        self.crank_open = true;
        self.crank_counter += 1;
        self.undo.clear();
        Ok(())
    }

    fn savepoint(&mut self) -> StoreResult<Savepoint> {
        if !self.crank_open {
            return Err(StoreError::NoCrankOpen);
        }
        Ok(Savepoint {
            crank: self.crank_counter,
            index: self.undo.len(),
        })
    }

    fn rollback_to(&mut self, savepoint: Savepoint) -> StoreResult<()> {
        if !self.crank_open {
            return Err(StoreError::NoCrankOpen);
        }
        if savepoint.crank != self.crank_counter {
            return Err(StoreError::InvalidSavepoint(format!(
                "savepoint from crank {} used in crank {}",
                savepoint.crank, self.crank_counter
            )));
        }
        if savepoint.index > self.undo.len() {
            return Err(StoreError::InvalidSavepoint(format!(
                "savepoint index {} beyond write log of length {}",
                savepoint.index,
                self.undo.len()
            )));
        }
        self.unwind_to(savepoint.index);
        Ok(())
    }

    fn commit_crank(&mut self) -> StoreResult<()> {
        if !self.crank_open {
            return Err(StoreError::NoCrankOpen);
        }
        self.crank_open = false;
        self.undo.clear();
        Ok(())
    }

    fn abort_crank(&mut self) -> StoreResult<()> {
        if !self.crank_open {
            return Err(StoreError::NoCrankOpen);
        }
        self.unwind_to(0);
        self.crank_open = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_round_trip() {
        let mut store = MemStore::new();
        store.begin_crank().unwrap();
        store.set("a.1", b"one").unwrap();
        assert_eq!(store.get("a.1").unwrap(), Some(b"one".to_vec()));
        store.commit_crank().unwrap();
        assert_eq!(store.get("a.1").unwrap(), Some(b"one".to_vec()));
    }

    #[test]
    fn abort_restores_pre_crank_state() {
        let mut store = MemStore::new();
        store.begin_crank().unwrap();
        store.set("a", b"kept").unwrap();
        store.commit_crank().unwrap();

        store.begin_crank().unwrap();
        store.set("a", b"clobbered").unwrap();
        store.set("b", b"new").unwrap();
        store.delete("a").unwrap();
        store.abort_crank().unwrap();

        assert_eq!(store.get("a").unwrap(), Some(b"kept".to_vec()));
        assert_eq!(store.get("b").unwrap(), None);
    }

    #[test]
    fn partial_rollback_keeps_earlier_writes() {
        let mut store = MemStore::new();
        store.begin_crank().unwrap();
        store.set("before", b"1").unwrap();
        let sp = store.savepoint().unwrap();
        store.set("after", b"2").unwrap();
        store.delete("before").unwrap();
        store.rollback_to(sp).unwrap();
        store.commit_crank().unwrap();

        assert_eq!(store.get("before").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get("after").unwrap(), None);
    }

    #[test]
    fn stale_savepoint_is_fatal() {
        let mut store = MemStore::new();
        store.begin_crank().unwrap();
        let sp = store.savepoint().unwrap();
        store.commit_crank().unwrap();
        store.begin_crank().unwrap();
        let err = store.rollback_to(sp).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn prefix_scan_is_sorted_and_bounded() {
        let mut store = MemStore::new();
        store.begin_crank().unwrap();
        store.set("ko2.owner", b"v1").unwrap();
        store.set("ko10.owner", b"v1").unwrap();
        store.set("kp3.state", b"x").unwrap();
        store.set("ko2.refCount", b"1,1").unwrap();
        store.commit_crank().unwrap();

        let keys = store.keys_with_prefix("ko2.").unwrap();
        assert_eq!(keys, vec!["ko2.owner".to_string(), "ko2.refCount".to_string()]);
        assert!(store.keys_with_prefix("kq").unwrap().is_empty());
    }
}
