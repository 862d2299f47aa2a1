//! In-process key-value backend (for testing and simulation)

use super::{KeyValue, KvBackend};
use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// BTreeMap-backed store; ordering matches byte-wise key order
#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    entries: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
            .collect())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put_if(
        &self,
        guard_key: &str,
        expected: Option<&[u8]>,
        puts: Vec<KeyValue>,
    ) -> Result<bool> {
        let mut entries = self.entries.write();
        if entries.get(guard_key).map(Vec::as_slice) != expected {
            return Ok(false);
        }
        for kv in puts {
            entries.insert(kv.key, kv.value);
        }
        Ok(true)
    }

    async fn put_all(&self, puts: Vec<KeyValue>) -> Result<()> {
        let mut entries = self.entries.write();
        for kv in puts {
            entries.insert(kv.key, kv.value);
        }
        Ok(())
    }
}
