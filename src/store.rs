//! Persistent key-value stores backing the hash, index and patch caches.
//!
//! All caches use the same byte-oriented contract with different key schemas.
//! The SQLite store keeps a single connection behind a mutex, one table per
//! schema, so several caches can share one database file.

use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Byte-oriented key-value store, safe to share between threads.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Insert only when the key is absent. Returns true if the value was written.
    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        if self.get(key)?.is_some() {
            return Ok(false);
        }
        self.put(key, value)?;
        Ok(true)
    }

    fn delete(&self, key: &[u8]) -> Result<bool>;
}

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    table: String,
    db_path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) `table` inside the database at `db_path`.
    pub fn open(db_path: &Path, table: &str) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| crate::Error::io(parent, e))?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = 10000;
             PRAGMA temp_store = MEMORY;
             PRAGMA busy_timeout = 5000;",
        )?;

        let store = Self::with_connection(conn, table, Some(db_path.to_path_buf()))?;
        info!("Opened cache table '{}' at {}", table, db_path.display());
        Ok(store)
    }

    /// Store that lives only as long as the process (for tests and dry runs).
    pub fn in_memory(table: &str) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, table, None)
    }

    fn with_connection(conn: Connection, table: &str, db_path: Option<PathBuf>) -> Result<Self> {
        let table = sanitize_table(table);
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    key BLOB PRIMARY KEY,
                    value BLOB NOT NULL
                ) WITHOUT ROWID",
                table
            ),
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            table,
            db_path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Number of stored entries.
    pub fn len(&self) -> Result<usize> {
        let conn = self.lock();
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |row| {
            row.get(0)
        })?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Reclaim space after large purges.
    pub fn vacuum(&self) -> Result<()> {
        self.lock().execute_batch("VACUUM")?;
        debug!("Vacuumed cache table '{}'", self.table);
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A panic while holding the lock leaves the connection usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn sanitize_table(table: &str) -> String {
    table
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

impl KvStore for SqliteStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!("SELECT value FROM {} WHERE key = ?1", self.table))?;
        let value = stmt
            .query_row(params![key], |row| row.get::<_, Vec<u8>>(0))
            .optional()?;
        Ok(value)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            &format!("INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)", self.table),
            params![key, value],
        )?;
        Ok(())
    }

    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let conn = self.lock();
        let written = conn.execute(
            &format!("INSERT OR IGNORE INTO {} (key, value) VALUES (?1, ?2)", self.table),
            params![key, value],
        )?;
        Ok(written > 0)
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        let conn = self.lock();
        let deleted = conn.execute(&format!("DELETE FROM {} WHERE key = ?1", self.table), params![key])?;
        Ok(deleted > 0)
    }
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    map: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let map = self.map.read().unwrap_or_else(|p| p.into_inner());
        Ok(map.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut map = self.map.write().unwrap_or_else(|p| p.into_inner());
        map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let mut map = self.map.write().unwrap_or_else(|p| p.into_inner());
        if map.contains_key(key) {
            return Ok(false);
        }
        map.insert(key.to_vec(), value.to_vec());
        Ok(true)
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        let mut map = self.map.write().unwrap_or_else(|p| p.into_inner());
        Ok(map.remove(key).is_some())
    }
}
