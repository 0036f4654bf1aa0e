//! Driftsync Configuration
//!
//! Configuration structures for the coordinator: node identity, chunk
//! storage, synchronization tuning, and the HTTP API.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Chunk storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Synchronization tuning
    #[serde(default)]
    pub sync: SyncConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identifier the coordinator uses when it originates events
    pub id: String,

    /// Data directory for chunk bodies and the metadata store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Chunk storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Fixed chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

/// Synchronization tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Expected node heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Missed-heartbeat window before a node is marked offline
    /// (recommended 3x the heartbeat interval)
    #[serde(default = "default_node_offline_after_ms")]
    pub node_offline_after_ms: u64,

    /// Whole-session deadline in milliseconds
    #[serde(default = "default_session_deadline_ms")]
    pub session_deadline_ms: u64,

    /// Per-chunk transfer deadline in milliseconds
    #[serde(default = "default_chunk_deadline_ms")]
    pub chunk_deadline_ms: u64,

    /// Concurrent replication sessions per target node
    #[serde(default = "default_sessions_per_target")]
    pub max_sessions_per_target: usize,

    /// Coordinator-wide cap on concurrent replication sessions
    #[serde(default = "default_sessions_total")]
    pub max_sessions_total: usize,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./driftsync-data")
}

fn default_chunk_size() -> usize {
    4096
}

fn default_heartbeat_interval_ms() -> u64 {
    5000
}

fn default_node_offline_after_ms() -> u64 {
    15_000
}

fn default_session_deadline_ms() -> u64 {
    300_000
}

fn default_chunk_deadline_ms() -> u64 {
    30_000
}

fn default_sessions_per_target() -> usize {
    1
}

fn default_sessions_total() -> usize {
    16
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            node_offline_after_ms: default_node_offline_after_ms(),
            session_deadline_ms: default_session_deadline_ms(),
            chunk_deadline_ms: default_chunk_deadline_ms(),
            max_sessions_per_target: default_sessions_per_target(),
            max_sessions_total: default_sessions_total(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: CoordinatorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.storage.chunk_size == 0 {
            return Err(crate::Error::Config(
                "storage.chunk_size must be positive".into(),
            ));
        }

        if self.sync.max_sessions_per_target == 0 || self.sync.max_sessions_total == 0 {
            return Err(crate::Error::Config(
                "sync session caps must be positive".into(),
            ));
        }

        if self.sync.node_offline_after_ms < self.sync.heartbeat_interval_ms {
            return Err(crate::Error::Config(
                "sync.node_offline_after_ms must be at least the heartbeat interval".into(),
            ));
        }

        Ok(())
    }

    /// Get the chunk storage directory
    pub fn chunk_dir(&self) -> PathBuf {
        self.node.data_dir.join("chunks")
    }

    /// Get the metadata store path
    pub fn metadata_path(&self) -> PathBuf {
        self.node.data_dir.join("metadata.db")
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.sync.heartbeat_interval_ms)
    }

    /// Get the node offline window as Duration
    pub fn node_offline_after(&self) -> Duration {
        Duration::from_millis(self.sync.node_offline_after_ms)
    }

    /// Get the whole-session deadline as Duration
    pub fn session_deadline(&self) -> Duration {
        Duration::from_millis(self.sync.session_deadline_ms)
    }

    /// Get the per-chunk deadline as Duration
    pub fn chunk_deadline(&self) -> Duration {
        Duration::from_millis(self.sync.chunk_deadline_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "coordinator-1"
data_dir = "/tmp/driftsync"

[storage]
chunk_size = 4096

[sync]
heartbeat_interval_ms = 1000
node_offline_after_ms = 3000
"#;

        let config = CoordinatorConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "coordinator-1");
        assert_eq!(config.storage.chunk_size, 4096);
        assert_eq!(config.node_offline_after(), Duration::from_secs(3));
        assert_eq!(config.sync.max_sessions_per_target, 1);
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        let toml = r#"
[node]
id = "coordinator-1"

[storage]
chunk_size = 0
"#;

        assert!(CoordinatorConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_rejects_offline_window_below_heartbeat() {
        let toml = r#"
[node]
id = "coordinator-1"

[sync]
heartbeat_interval_ms = 5000
node_offline_after_ms = 1000
"#;

        assert!(CoordinatorConfig::from_str(toml).is_err());
    }
}
