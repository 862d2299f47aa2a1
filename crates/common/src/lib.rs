//! meshconf Common Library
//!
//! Node configuration records, their key-value mapping and the store that
//! allocates identifiers, shared by the meshconf daemon and CLI.

pub mod allocation;
pub mod config_service;
pub mod crypto;
pub mod error;
pub mod kv;
pub mod mapper;
pub mod metrics;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use allocation::AddressPlan;
pub use config_service::{ConfigRequest, ConfigResponse, ConfigService, Resolver, TokioResolver};
pub use crypto::{KeyPair, Signer, SignifyPublicKey};
pub use error::{Error, Result};
pub use kv::{KeyValue, KvBackend, MemoryKv, SqliteKv};
pub use metrics::{MetricsReport, RequestMetrics};
pub use store::{NodeCounter, NodeStore, StoreOptions};
pub use types::*;

/// meshconf version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default state directory
pub fn default_state_dir() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".meshconf")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_state_dir().join("meshconf.db")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
