//! Node configuration store
//!
//! Node records live below `<config prefix><node key>/<field>`. The
//! identifier counter lives outside the config prefix so prefix scans never
//! see it.

use crate::kv::{KeyValue, KvBackend};
use crate::mapper::{decode_map, decode_record, encode_record, KvRecord};
use crate::types::{NodeRecord, DEFAULT_NODE_KEY};
use crate::{Error, Result};
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default namespace for node records
pub const DEFAULT_CONFIG_PREFIX: &str = "/config/";

/// Default key of the identifier counter
pub const DEFAULT_COUNTER_KEY: &str = "/next_free_id";

/// Default cap on create-node transaction attempts
pub const DEFAULT_MAX_ATTEMPTS: u32 = 64;

const BACKOFF_BASE: Duration = Duration::from_millis(5);
const BACKOFF_CAP: Duration = Duration::from_millis(250);

/// Store layout and retry settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    pub config_prefix: String,
    pub counter_key: String,
    pub max_attempts: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            config_prefix: DEFAULT_CONFIG_PREFIX.to_string(),
            counter_key: DEFAULT_COUNTER_KEY.to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Source of the configured-node count, reported alongside request metrics
#[async_trait::async_trait]
pub trait NodeCounter: Send + Sync {
    async fn node_count(&self) -> Result<u64>;
}

/// Typed access to node records in a [`KvBackend`]
#[derive(Clone)]
pub struct NodeStore {
    kv: Arc<dyn KvBackend>,
    options: StoreOptions,
    id_key: Regex,
}

impl NodeStore {
    /// Create a store with the default layout
    pub fn new(kv: Arc<dyn KvBackend>) -> Result<Self> {
        Self::with_options(kv, StoreOptions::default())
    }

    pub fn with_options(kv: Arc<dyn KvBackend>, options: StoreOptions) -> Result<Self> {
        if !options.config_prefix.ends_with('/') {
            return Err(Error::InvalidConfig(format!(
                "config prefix {:?} must end with '/'",
                options.config_prefix
            )));
        }
        if options.counter_key.starts_with(&options.config_prefix) {
            return Err(Error::InvalidConfig(format!(
                "counter key {:?} must live outside the config prefix",
                options.counter_key
            )));
        }

        let id_key = id_key_regex(&options.config_prefix)?;
        Ok(Self {
            kv,
            options,
            id_key,
        })
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    fn node_prefix(&self, key: &str) -> String {
        format!("{}{}/", self.options.config_prefix, key)
    }

    /// The record stored for `key`, without the default overlay
    pub async fn get_only(&self, key: &str) -> Result<NodeRecord> {
        let prefix = self.node_prefix(key);
        let pairs = self.kv.get_prefix(&prefix).await?;
        if pairs.is_empty() {
            return Err(Error::node_not_found(key));
        }

        let (record, applied) = decode_record(&pairs, &prefix)?;
        debug!("Loaded {} fields for node {}", applied, key);
        Ok(record)
    }

    /// The default record
    pub async fn get_default(&self) -> Result<NodeRecord> {
        self.get_only(DEFAULT_NODE_KEY).await
    }

    /// The record for `key` overlaid on the default record
    pub async fn get_with_defaults(&self, key: &str) -> Result<NodeRecord> {
        let default = self.get_default().await?;
        let node = self.get_only(key).await?;
        Ok(node.with_defaults(&default))
    }

    /// Allocate the next identifier and write a new node record for `key`.
    ///
    /// `fill` receives a draft holding only the tentative identifier and may
    /// populate further fields. It runs once per attempt, so it must not
    /// depend on state from an earlier attempt. Returns the identifier that
    /// was committed.
    pub async fn create_node<F>(&self, key: &str, mut fill: F) -> Result<u64>
    where
        F: FnMut(&mut NodeRecord) -> Result<()>,
    {
        let prefix = self.node_prefix(key);
        let counter_key = self.options.counter_key.as_str();
        let max_attempts = self.options.max_attempts.max(1);

        for attempt in 0..max_attempts {
            let raw = self
                .kv
                .get(counter_key)
                .await?
                .ok_or_else(|| Error::MissingCounter {
                    key: counter_key.to_string(),
                })?;
            let id = parse_counter(counter_key, &raw)?;

            let mut draft = NodeRecord {
                id: Some(id),
                ..Default::default()
            };
            fill(&mut draft)?;
            draft.id = Some(id);

            let mut puts = encode_record(&draft, &prefix);
            puts.push(KeyValue::new(counter_key, (id + 1).to_string()));

            if self.kv.put_if(counter_key, Some(raw.as_slice()), puts).await? {
                info!("Created node {} with id {}", key, id);
                return Ok(id);
            }

            let delay = backoff_delay(attempt);
            debug!(
                "Counter moved while creating node {} (attempt {}), retrying in {:?}",
                key,
                attempt + 1,
                delay
            );
            tokio::time::sleep(delay).await;
        }

        warn!("Giving up creating node {} after {} attempts", key, max_attempts);
        Err(Error::AllocationContention {
            attempts: max_attempts,
        })
    }

    /// Number of nodes owning an identifier
    pub async fn node_count(&self) -> Result<u64> {
        let keys = self.kv.keys_with_prefix(&self.options.config_prefix).await?;
        Ok(keys.iter().filter(|k| self.id_key.is_match(k)).count() as u64)
    }

    /// Keys of all nodes owning an identifier, ascending
    pub async fn node_keys(&self) -> Result<Vec<String>> {
        let keys = self.kv.keys_with_prefix(&self.options.config_prefix).await?;
        Ok(keys
            .iter()
            .filter_map(|k| self.id_key.captures(k))
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .collect())
    }

    /// Every record in one read, with the default record split out.
    ///
    /// A missing default record yields an empty one.
    pub async fn get_all(&self) -> Result<(BTreeMap<String, NodeRecord>, NodeRecord)> {
        let pairs = self.kv.get_prefix(&self.options.config_prefix).await?;
        let (mut nodes, applied) = decode_map::<NodeRecord>(&pairs, &self.options.config_prefix)?;
        let default = nodes.remove(DEFAULT_NODE_KEY).unwrap_or_default();

        debug!("Loaded {} nodes ({} fields)", nodes.len(), applied);
        Ok((nodes, default))
    }

    /// Write every present field of `record` under `key`
    pub async fn put_node(&self, key: &str, record: &NodeRecord) -> Result<()> {
        let puts = encode_record(record, &self.node_prefix(key));
        if puts.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "record for {key} has no fields set"
            )));
        }
        self.kv.put_all(puts).await
    }

    /// Seed the identifier counter with `start` unless it already exists.
    ///
    /// Returns whether the counter was written.
    pub async fn init_counter(&self, start: u64) -> Result<bool> {
        let counter_key = self.options.counter_key.as_str();
        let written = self
            .kv
            .put_if(
                counter_key,
                None,
                vec![KeyValue::new(counter_key, start.to_string())],
            )
            .await?;
        if written {
            info!("Initialized {} to {}", counter_key, start);
        }
        Ok(written)
    }

    /// Current counter value, `None` when it has not been seeded
    pub async fn next_free_id(&self) -> Result<Option<u64>> {
        let counter_key = self.options.counter_key.as_str();
        match self.kv.get(counter_key).await? {
            Some(raw) => Ok(Some(parse_counter(counter_key, &raw)?)),
            None => Ok(None),
        }
    }

    /// For each field set on the default record, which nodes inherit it and
    /// which override it with a different value
    pub async fn override_report(&self) -> Result<Vec<FieldOverrides>> {
        let (nodes, default) = self.get_all().await?;
        let mut report = Vec::new();

        for field in NodeRecord::FIELDS {
            let Some(default_value) = (field.encode)(&default) else {
                continue;
            };

            let mut entry = FieldOverrides {
                field: field.suffix.to_string(),
                default_value: String::from_utf8_lossy(&default_value).into_owned(),
                inherited: 0,
                overrides: Vec::new(),
            };

            for (key, node) in nodes.iter().filter(|(_, n)| n.id.is_some()) {
                match (field.encode)(node) {
                    None => entry.inherited += 1,
                    Some(value) if value != default_value => entry.overrides.push(NodeOverride {
                        node: key.clone(),
                        value: String::from_utf8_lossy(&value).into_owned(),
                    }),
                    Some(_) => {}
                }
            }
            report.push(entry);
        }

        Ok(report)
    }
}

#[async_trait::async_trait]
impl NodeCounter for NodeStore {
    async fn node_count(&self) -> Result<u64> {
        NodeStore::node_count(self).await
    }
}

/// One default field and the nodes diverging from it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldOverrides {
    pub field: String,
    pub default_value: String,
    /// Nodes that leave the field unset and inherit the default
    pub inherited: u64,
    pub overrides: Vec<NodeOverride>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOverride {
    pub node: String,
    pub value: String,
}

fn id_key_regex(prefix: &str) -> Result<Regex> {
    let pattern = format!("^{}([A-Za-z0-9=_-]+)/id$", regex::escape(prefix));
    Regex::new(&pattern).map_err(|e| Error::InvalidConfig(format!("node id pattern: {e}")))
}

fn parse_counter(key: &str, raw: &[u8]) -> Result<u64> {
    std::str::from_utf8(raw)
        .map_err(|e| Error::malformed(key, e))?
        .trim()
        .parse::<u64>()
        .map_err(|e| Error::malformed(key, e))
}

/// Exponential backoff with jitter for attempt `attempt` (0-based)
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << attempt.min(16));
    let ceiling = exp.min(BACKOFF_CAP);
    let millis = ceiling.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
}
