//! Node Commands

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use meshconf_common::{AddressPlan, NodeRecord, NodeStore, PublicKey, DEFAULT_NODE_KEY};
use serde::Serialize;
use std::path::PathBuf;

use crate::output::{opt, print_item, print_list, print_success, print_value, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum NodeCommands {
    /// Show a node's effective configuration
    Get {
        /// Node public key (base64) or store key
        key: String,

        /// Show only the node's own values, without defaults
        #[arg(long)]
        only: bool,
    },

    /// Show the default record
    Default,

    /// List all nodes
    List {
        /// Apply the default record to every node
        #[arg(long)]
        effective: bool,
    },

    /// Count nodes with an identifier
    Count,

    /// Register a node, allocating its identifier and address ranges
    Create {
        /// Node public key (base64)
        pubkey: String,
    },

    /// Write fields of a node or of the default record
    Set {
        /// Node public key (base64), store key, or "default"
        key: String,

        #[command(flatten)]
        fields: FieldArgs,
    },
}

#[derive(Args, Default)]
pub struct FieldArgs {
    #[arg(long)]
    pub mtu: Option<u64>,

    #[arg(long)]
    pub retry: Option<u64>,

    /// Keepalive in seconds, 0 disables it
    #[arg(long)]
    pub wg_keepalive: Option<u64>,

    #[arg(long)]
    pub range4: Option<String>,

    #[arg(long)]
    pub range6: Option<String>,

    #[arg(long)]
    pub address4: Option<String>,

    #[arg(long)]
    pub address6: Option<String>,

    /// Space separated, 1-based concentrator indices
    #[arg(long)]
    pub selected_concentrators: Option<String>,

    /// JSON file listing the concentrators
    #[arg(long)]
    pub concentrators_file: Option<PathBuf>,
}

impl FieldArgs {
    fn into_record(self) -> Result<NodeRecord> {
        let concentrators = match self.concentrators_file {
            Some(path) => {
                let blob = std::fs::read(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                // reject files the config service could not decode later
                serde_json::from_slice::<Vec<meshconf_common::ConcentratorRecord>>(&blob)
                    .with_context(|| format!("parsing {}", path.display()))?;
                Some(blob)
            }
            None => None,
        };

        Ok(NodeRecord {
            id: None,
            concentrators,
            mtu: self.mtu,
            retry: self.retry,
            wg_keepalive: self.wg_keepalive,
            range4: self.range4,
            range6: self.range6,
            address4: self.address4,
            address6: self.address6,
            selected_concentrators: self.selected_concentrators,
        })
    }
}

/// Node display wrapper for serialization
#[derive(Serialize)]
pub struct NodeDisplay {
    pub key: String,
    pub id: Option<u64>,
    pub mtu: Option<u64>,
    pub retry: Option<u64>,
    pub wg_keepalive: Option<u64>,
    pub range4: Option<String>,
    pub range6: Option<String>,
    pub address4: Option<String>,
    pub address6: Option<String>,
    pub selected_concentrators: Option<String>,
    pub concentrators: Option<usize>,
}

impl NodeDisplay {
    fn new(key: &str, record: NodeRecord) -> Self {
        let concentrators = record
            .concentrators
            .as_ref()
            .map(|_| record.concentrators().map(|c| c.len()).unwrap_or(0));
        Self {
            key: display_key(key),
            id: record.id,
            mtu: record.mtu,
            retry: record.retry,
            wg_keepalive: record.wg_keepalive,
            range4: record.range4,
            range6: record.range6,
            address4: record.address4,
            address6: record.address6,
            selected_concentrators: record.selected_concentrators,
            concentrators,
        }
    }
}

impl TableDisplay for NodeDisplay {
    fn headers() -> Vec<&'static str> {
        vec![
            "Key", "ID", "MTU", "Retry", "Keepalive", "Range4", "Range6", "Address4", "Address6",
            "Selected", "Concentrators",
        ]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.key.clone(),
            opt(&self.id),
            opt(&self.mtu),
            opt(&self.retry),
            opt(&self.wg_keepalive),
            opt(&self.range4),
            opt(&self.range6),
            opt(&self.address4),
            opt(&self.address6),
            opt(&self.selected_concentrators),
            opt(&self.concentrators),
        ]
    }
}

/// Map user input to the key nodes are stored under
pub fn store_key(input: &str) -> Result<String> {
    if input == DEFAULT_NODE_KEY {
        return Ok(input.to_string());
    }
    if let Ok(key) = PublicKey::from_base64(input) {
        return Ok(key.to_store_key());
    }
    PublicKey::from_store_key(input)
        .map(|key| key.to_store_key())
        .with_context(|| format!("{input:?} is neither a public key nor \"{DEFAULT_NODE_KEY}\""))
}

/// Show store keys in the base64 form wg(8) prints
fn display_key(key: &str) -> String {
    PublicKey::from_store_key(key)
        .map(|k| k.to_base64())
        .unwrap_or_else(|_| key.to_string())
}

pub async fn execute(cmd: NodeCommands, store: NodeStore, format: OutputFormat) -> Result<()> {
    match cmd {
        NodeCommands::Get { key, only } => {
            let key = store_key(&key)?;
            let record = if only {
                store.get_only(&key).await?
            } else {
                store.get_with_defaults(&key).await?
            };
            print_item(&NodeDisplay::new(&key, record), format)?;
        }

        NodeCommands::Default => {
            let record = store.get_default().await?;
            print_item(&NodeDisplay::new(DEFAULT_NODE_KEY, record), format)?;
        }

        NodeCommands::List { effective } => {
            let (nodes, default) = store.get_all().await?;
            let displays: Vec<NodeDisplay> = nodes
                .into_iter()
                .map(|(key, record)| {
                    let record = if effective {
                        record.with_defaults(&default)
                    } else {
                        record
                    };
                    NodeDisplay::new(&key, record)
                })
                .collect();
            print_list(&displays, format)?;
        }

        NodeCommands::Count => {
            let count = store.node_count().await?;
            print_value("nodes", &count, format)?;
        }

        NodeCommands::Create { pubkey } => {
            let key = PublicKey::from_base64(&pubkey)
                .with_context(|| format!("{pubkey:?} is not a base64 public key"))?
                .to_store_key();
            let plan = AddressPlan::default().with_env_overrides()?;

            let id = store.create_node(&key, |draft| plan.fill(draft)).await?;
            print_success(&format!("Node {} registered with id {}", pubkey, id));
            print_item(&NodeDisplay::new(&key, store.get_only(&key).await?), format)?;
        }

        NodeCommands::Set { key, fields } => {
            let key = store_key(&key)?;
            store.put_node(&key, &fields.into_record()?).await?;
            print_success(&format!("Updated {}", display_key(&key)));
            print_item(&NodeDisplay::new(&key, store.get_only(&key).await?), format)?;
        }
    }

    Ok(())
}
