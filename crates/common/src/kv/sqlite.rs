//! SQLite key-value backend
//!
//! Keys are TEXT with the default BINARY collation, so `ORDER BY key` gives
//! the same byte-wise ordering the mapper relies on.

use super::{KeyValue, KvBackend};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// How long a write waits for another connection's lock before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// SQLite-backed store shared by the daemon and the CLI
#[derive(Clone)]
pub struct SqliteKv {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKv {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        conn.busy_timeout(BUSY_TIMEOUT)?;

        // WAL lets the CLI read while the daemon holds the file
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let kv = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        kv.init_schema()?;

        info!("Opened key-value database at {:?}", path.as_ref());
        Ok(kv)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let kv = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        kv.init_schema()?;
        Ok(kv)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        debug!("Key-value schema initialized");
        Ok(())
    }

    fn scan(conn: &Connection, prefix: &str) -> Result<Vec<KeyValue>> {
        let mut stmt =
            conn.prepare("SELECT key, value FROM kv_store WHERE key >= ?1 ORDER BY key ASC")?;
        let rows = stmt.query_map(params![prefix], |row| {
            Ok(KeyValue {
                key: row.get(0)?,
                value: row.get(1)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            let kv = row?;
            if !kv.key.starts_with(prefix) {
                break;
            }
            results.push(kv);
        }
        Ok(results)
    }

    fn write(conn: &Connection, puts: &[KeyValue]) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut stmt = conn.prepare(
            "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)",
        )?;
        for kv in puts {
            stmt.execute(params![kv.key, kv.value, now])?;
        }
        Ok(())
    }
}

#[async_trait]
impl KvBackend for SqliteKv {
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let conn = self.conn.lock();
        Self::scan(&conn, prefix)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        Ok(Self::scan(&conn, prefix)?
            .into_iter()
            .map(|kv| kv.key)
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn put_if(
        &self,
        guard_key: &str,
        expected: Option<&[u8]>,
        puts: Vec<KeyValue>,
    ) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<Vec<u8>> = tx
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![guard_key],
                |row| row.get(0),
            )
            .optional()?;

        if current.as_deref() != expected {
            debug!("Guard on {} did not hold, rolling back", guard_key);
            return Ok(false);
        }

        Self::write(&tx, &puts)?;
        tx.commit()?;

        debug!("Committed {} puts guarded by {}", puts.len(), guard_key);
        Ok(true)
    }

    async fn put_all(&self, puts: Vec<KeyValue>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Self::write(&tx, &puts)?;
        tx.commit()?;
        Ok(())
    }
}
