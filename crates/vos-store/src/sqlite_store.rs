use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use crate::{DurableStore, Savepoint, StoreError, StoreResult, prefix_upper_bound};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS kvstore (
  key TEXT PRIMARY KEY,
  value BLOB NOT NULL
);
";

/// SQLite-backed durable store. Crank transactions map onto one SQLite
/// transaction; kernel savepoints map onto SQLite `SAVEPOINT` markers.
pub struct SqliteStore {
    conn: Connection,
    crank_open: bool,
    crank_counter: u64,
    // Indices of savepoints still live inside the current crank, oldest first.
    active_savepoints: Vec<usize>,
    next_savepoint: usize,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        log::debug!("opening sqlite store at {}", path.as_ref().display());
        Self::from_connection(Connection::open(path.as_ref())?)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn,
            crank_open: false,
            crank_counter: 0,
            active_savepoints: Vec::new(),
            next_savepoint: 0,
        })
    }
}

impl DurableStore for SqliteStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM kvstore WHERE key = ?1",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&mut self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO kvstore (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&mut self, key: &str) -> StoreResult<()> {
        self.conn
            .execute("DELETE FROM kvstore WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        match prefix_upper_bound(prefix) {
            Some(upper) => {
                let mut stmt = self
                    .conn
                    .prepare("SELECT key FROM kvstore WHERE key >= ?1 AND key < ?2 ORDER BY key")?;
                let rows = stmt.query_map(params![prefix, upper], |row| row.get::<_, String>(0))?;
                for row in rows {
                    keys.push(row?);
                }
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare("SELECT key FROM kvstore WHERE key >= ?1 ORDER BY key")?;
                let rows = stmt.query_map(params![prefix], |row| row.get::<_, String>(0))?;
                for row in rows {
                    keys.push(row?);
                }
            }
        }
        Ok(keys)
    }

    fn begin_crank(&mut self) -> StoreResult<()> {
        if self.crank_open {
            return Err(StoreError::CrankAlreadyOpen);
        }
        self.conn.execute_batch("BEGIN")?;
        self.crank_open = true;
        self.crank_counter += 1;
        self.active_savepoints.clear();
        Ok(())
    }

    fn savepoint(&mut self) -> StoreResult<Savepoint> {
        if !self.crank_open {
            return Err(StoreError::NoCrankOpen);
        }
        let index = self.next_savepoint;
        self.next_savepoint += 1;
        self.conn.execute_batch(&format!("SAVEPOINT sp{index}"))?;
        self.active_savepoints.push(index);
        Ok(Savepoint {
            crank: self.crank_counter,
            index,
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
        let Some(pos) = self
            .active_savepoints
            .iter()
            .position(|idx| *idx == savepoint.index)
        else {
            return Err(StoreError::InvalidSavepoint(format!(
                "savepoint sp{} is not live in the current crank",
                savepoint.index
            )));
        };
        self.conn
            .execute_batch(&format!("ROLLBACK TO sp{}", savepoint.index))?;
        // Savepoints established after the target are discarded by SQLite;
        // the target itself stays live for repeated rollback.
        self.active_savepoints.truncate(pos + 1);
        Ok(())
    }

    fn commit_crank(&mut self) -> StoreResult<()> {
        if !self.crank_open {
            return Err(StoreError::NoCrankOpen);
        }
        self.conn.execute_batch("COMMIT")?;
        self.crank_open = false;
        self.active_savepoints.clear();
        Ok(())
    }

    fn abort_crank(&mut self) -> StoreResult<()> {
        if !self.crank_open {
            return Err(StoreError::NoCrankOpen);
        }
        log::debug!("aborting crank {}", self.crank_counter);
        self.conn.execute_batch("ROLLBACK")?;
        self.crank_open = false;
        self.active_savepoints.clear();
        Ok(())
    }
}
