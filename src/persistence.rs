//! Database persistence layer for AuthorityChain
//!
//! Every entity lives in its own independently transactional table. A table
//! is opened, written and then either committed or discarded; the
//! [`crate::store::StoreCoordinator`] moves a whole set of tables through
//! that bracket together.

use crate::error::ChainError;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;

/// A store that takes part in a coordinated open/commit/discard cycle.
pub trait Repository: Send + Sync {
    fn name(&self) -> &'static str;

    /// Begins a transaction. Fails if one is already open.
    fn open(&self) -> Result<(), ChainError>;

    /// Makes every write since `open` durable.
    fn commit(&self) -> Result<(), ChainError>;

    /// Drops every write since `open`. A no-op when nothing is open.
    fn discard(&self) -> Result<(), ChainError>;

    fn is_open(&self) -> bool;
}

/// Byte-keyed table. Reads see uncommitted writes of the open transaction;
/// writes require an open transaction.
pub trait KvTable: Repository {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), ChainError>;
    fn delete(&self, key: &[u8]) -> Result<(), ChainError>;
    /// All entries ordered by key.
    fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ChainError>;
}

fn write_outside_transaction(table: &str) -> ChainError {
    ChainError::Storage(format!("write to '{}' outside a transaction", table))
}

/// SQLite-backed table, one database per table.
pub struct SqliteTable {
    name: &'static str,
    conn: Mutex<Connection>,
}

impl SqliteTable {
    pub fn open_path(name: &'static str, path: &Path) -> Result<Self, ChainError> {
        let conn = Connection::open(path).map_err(|e| {
            ChainError::Storage(format!("Failed to open database {}: {}", path.display(), e))
        })?;
        Self::with_connection(name, conn)
    }

    pub fn open_in_memory(name: &'static str) -> Result<Self, ChainError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ChainError::Storage(format!("Failed to open in-memory database: {}", e)))?;
        Self::with_connection(name, conn)
    }

    fn with_connection(name: &'static str, conn: Connection) -> Result<Self, ChainError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS entries (
                key BLOB PRIMARY KEY,
                value BLOB NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::Storage(format!("Failed to create table '{}': {}", name, e)))?;

        Ok(SqliteTable {
            name,
            conn: Mutex::new(conn),
        })
    }
}

impl Repository for SqliteTable {
    fn name(&self) -> &'static str {
        self.name
    }

    fn open(&self) -> Result<(), ChainError> {
        let conn = self.conn.lock();
        if !conn.is_autocommit() {
            return Err(ChainError::Storage(format!(
                "table '{}' already has an open transaction",
                self.name
            )));
        }
        conn.execute_batch("BEGIN IMMEDIATE").map_err(|e| {
            ChainError::Storage(format!("Failed to begin transaction on '{}': {}", self.name, e))
        })
    }

    fn commit(&self) -> Result<(), ChainError> {
        let conn = self.conn.lock();
        if conn.is_autocommit() {
            return Err(ChainError::Storage(format!(
                "commit on '{}' without an open transaction",
                self.name
            )));
        }
        conn.execute_batch("COMMIT").map_err(|e| {
            ChainError::Storage(format!("Failed to commit '{}': {}", self.name, e))
        })
    }

    fn discard(&self) -> Result<(), ChainError> {
        let conn = self.conn.lock();
        if conn.is_autocommit() {
            return Ok(());
        }
        conn.execute_batch("ROLLBACK").map_err(|e| {
            ChainError::Storage(format!("Failed to roll back '{}': {}", self.name, e))
        })
    }

    fn is_open(&self) -> bool {
        !self.conn.lock().is_autocommit()
    }
}

impl KvTable for SqliteTable {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM entries WHERE key = ?1",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), ChainError> {
        let conn = self.conn.lock();
        if conn.is_autocommit() {
            return Err(write_outside_transaction(self.name));
        }
        conn.execute(
            "INSERT OR REPLACE INTO entries (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), ChainError> {
        let conn = self.conn.lock();
        if conn.is_autocommit() {
            return Err(write_outside_transaction(self.name));
        }
        conn.execute("DELETE FROM entries WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ChainError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key, value FROM entries ORDER BY key ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

#[derive(Default)]
struct MemoryTableState {
    committed: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Writes of the open transaction; `None` marks a delete.
    staged: Option<BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
}

/// Simple in-memory table useful for tests and ephemeral runs.
pub struct MemoryTable {
    name: &'static str,
    state: Mutex<MemoryTableState>,
}

impl MemoryTable {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(MemoryTableState::default()),
        }
    }
}

impl Repository for MemoryTable {
    fn name(&self) -> &'static str {
        self.name
    }

    fn open(&self) -> Result<(), ChainError> {
        let mut state = self.state.lock();
        if state.staged.is_some() {
            return Err(ChainError::Storage(format!(
                "table '{}' already has an open transaction",
                self.name
            )));
        }
        state.staged = Some(BTreeMap::new());
        Ok(())
    }

    fn commit(&self) -> Result<(), ChainError> {
        let mut state = self.state.lock();
        let staged = state.staged.take().ok_or_else(|| {
            ChainError::Storage(format!(
                "commit on '{}' without an open transaction",
                self.name
            ))
        })?;
        for (key, value) in staged {
            match value {
                Some(value) => {
                    state.committed.insert(key, value);
                }
                None => {
                    state.committed.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn discard(&self) -> Result<(), ChainError> {
        self.state.lock().staged = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().staged.is_some()
    }
}

impl KvTable for MemoryTable {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        let state = self.state.lock();
        if let Some(staged) = state.staged.as_ref().and_then(|s| s.get(key)) {
            return Ok(staged.clone());
        }
        Ok(state.committed.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), ChainError> {
        let mut state = self.state.lock();
        let staged = state
            .staged
            .as_mut()
            .ok_or_else(|| write_outside_transaction(self.name))?;
        staged.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), ChainError> {
        let mut state = self.state.lock();
        let staged = state
            .staged
            .as_mut()
            .ok_or_else(|| write_outside_transaction(self.name))?;
        staged.insert(key.to_vec(), None);
        Ok(())
    }

    fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ChainError> {
        let state = self.state.lock();
        let mut merged = state.committed.clone();
        if let Some(staged) = &state.staged {
            for (key, value) in staged {
                match value {
                    Some(value) => {
                        merged.insert(key.clone(), value.clone());
                    }
                    None => {
                        merged.remove(key);
                    }
                }
            }
        }
        Ok(merged.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise_bracket(table: &dyn KvTable) {
        assert!(table.put(b"a", b"1").is_err(), "writes need an open transaction");

        table.open().unwrap();
        assert!(table.open().is_err(), "double open is refused");
        table.put(b"a", b"1").unwrap();
        table.put(b"b", b"2").unwrap();
        assert_eq!(table.get(b"a").unwrap(), Some(b"1".to_vec()));
        table.commit().unwrap();
        assert!(!table.is_open());

        table.open().unwrap();
        table.delete(b"a").unwrap();
        table.put(b"c", b"3").unwrap();
        assert_eq!(table.get(b"a").unwrap(), None);
        table.discard().unwrap();

        assert_eq!(table.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(table.get(b"c").unwrap(), None);
        let keys: Vec<Vec<u8>> = table.scan().unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);

        // Discarding with nothing open is harmless.
        table.discard().unwrap();
        assert!(table.commit().is_err());
    }

    #[test]
    fn test_memory_table_bracket() {
        exercise_bracket(&MemoryTable::new("memory"));
    }

    #[test]
    fn test_sqlite_table_bracket() {
        exercise_bracket(&SqliteTable::open_in_memory("sqlite").unwrap());
    }

    #[test]
    fn test_sqlite_table_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.db");
        {
            let table = SqliteTable::open_path("accounts", &path).unwrap();
            table.open().unwrap();
            table.put(b"k", b"v").unwrap();
            table.commit().unwrap();
        }
        let table = SqliteTable::open_path("accounts", &path).unwrap();
        assert_eq!(table.get(b"k").unwrap(), Some(b"v".to_vec()));
    }
}
