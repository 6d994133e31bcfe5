//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// HTTP API listen address
    pub http_listen: String,

    /// Peer update messaging
    pub messaging: MessagingConfig,

    /// ACL schema migration
    pub migration: MigrationConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_path: meshplane_common::default_store_path(),
            http_listen: "127.0.0.1:8081".to_string(),
            messaging: MessagingConfig::default(),
            migration: MigrationConfig::default(),
        }
    }
}

/// Peer update messaging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Send peer updates after ACL writes
    pub enabled: bool,

    /// Broker HTTP ingress; agents attached in-process when unset
    pub endpoint: Option<String>,

    /// Pending updates held before new ones are dropped
    pub queue_capacity: usize,

    /// Upper bound for a single publish
    pub publish_timeout_ms: u64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            queue_capacity: 64,
            publish_timeout_ms: 2000,
        }
    }
}

impl MessagingConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// Migration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Migrate ACLs before serving
    pub run_on_startup: bool,

    /// Re-run networks already marked as migrated
    pub force: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            run_on_startup: true,
            force: false,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration, writing the defaults out when the file is missing
    pub fn load_or_create(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let config = Self::default();
        config.save(path)?;
        info!("Wrote default configuration to {:?}", path);
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }

    /// Default config file location
    pub fn default_path() -> PathBuf {
        meshplane_common::default_store_path().join("config.toml")
    }
}
