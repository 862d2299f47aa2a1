//! Daemon configuration

use meshconf_common::StoreOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Node store location and layout
    pub store: StoreConfig,

    /// Tunnel device to reconcile
    pub device: DeviceConfig,

    /// Reconcile loop timing
    pub reconcile: ReconcileConfig,
}

/// Node store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database path
    pub db_path: PathBuf,

    /// Key prefix of node records
    pub config_prefix: String,

    /// Key of the identifier counter
    pub counter_key: String,

    /// Attempts before identifier allocation gives up
    pub max_create_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let options = StoreOptions::default();
        Self {
            db_path: meshconf_common::default_db_path(),
            config_prefix: options.config_prefix,
            counter_key: options.counter_key,
            max_create_attempts: options.max_attempts,
        }
    }
}

impl StoreConfig {
    pub fn options(&self) -> StoreOptions {
        StoreOptions {
            config_prefix: self.config_prefix.clone(),
            counter_key: self.counter_key.clone(),
            max_attempts: self.max_create_attempts,
        }
    }
}

/// Tunnel device configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Interface name
    pub name: String,

    /// Directory holding `<name>.sock` control sockets
    pub socket_dir: PathBuf,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "wg-nodes".to_string(),
            socket_dir: PathBuf::from("/var/run/wireguard"),
        }
    }
}

impl DeviceConfig {
    /// Control socket path of the device
    pub fn socket_path(&self) -> PathBuf {
        self.socket_dir.join(format!("{}.sock", self.name))
    }
}

/// Reconcile loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Seconds between reconcile passes
    pub interval_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}
