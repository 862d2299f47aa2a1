//! Key-value backend abstraction
//!
//! The node store only needs a handful of primitives from its backing store:
//! sorted prefix reads and one atomic conditional multi-put. Everything else
//! (transport, TLS, clustering) belongs to the backend implementation.

mod memory;
mod sqlite;

pub use memory::MemoryKv;
pub use sqlite::SqliteKv;

use crate::Result;
use async_trait::async_trait;

/// A single stored entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Transactional key-value store consumed by the node store
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// All entries whose key starts with `prefix`, ascending by key
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// All keys starting with `prefix`, ascending
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Value stored under exactly `key`
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Apply `puts` atomically if `guard_key` currently holds `expected`
    /// (`None` meaning the key must be absent).
    ///
    /// Returns whether the guard held and the puts were applied.
    async fn put_if(
        &self,
        guard_key: &str,
        expected: Option<&[u8]>,
        puts: Vec<KeyValue>,
    ) -> Result<bool>;

    /// Unconditional multi-put
    async fn put_all(&self, puts: Vec<KeyValue>) -> Result<()>;
}
