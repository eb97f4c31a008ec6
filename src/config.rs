//! WolfBlock Configuration
//!
//! This module provides configuration structures for the WolfBlock
//! controller, replica agents and sync agent.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main WolfBlock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfBlockConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Volume served by the controller
    #[serde(default)]
    pub volume: VolumeConfig,

    /// Controller behaviour
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Differential transfer configuration
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
    /// Unique node identifier
    pub id: String,

    /// Address the replica agent binds for controller and sync traffic
    pub bind_address: String,

    /// Data directory holding the snapshot chain and replica state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Flush every chain mutation to stable storage
    #[serde(default = "default_true")]
    pub fsync: bool,
}

/// Volume configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Volume name
    #[serde(default = "default_volume_name")]
    pub name: String,

    /// Volume size in bytes
    #[serde(default = "default_volume_size")]
    pub size: u64,

    /// Block size in bytes
    #[serde(default = "default_block_size")]
    pub block_size: u32,

    /// Number of ReadWrite replicas that must acknowledge a write.
    /// 1 keeps the volume available as long as any replica survives.
    #[serde(default = "default_write_quorum")]
    pub write_quorum: usize,

    /// Replica agent addresses
    #[serde(default)]
    pub replicas: Vec<String>,
}

/// Controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Connect timeout towards replicas in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-replica request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Per-layer transfer timeout during rebuild in milliseconds
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,

    /// Rebuild lagging replicas automatically when the volume starts
    #[serde(default = "default_true")]
    pub rebuild_on_start: bool,
}

/// Differential transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum number of blocks per transferred range
    #[serde(default = "default_batch_blocks")]
    pub batch_blocks: usize,

    /// Compress block payloads on the wire with LZ4
    #[serde(default = "default_true")]
    pub compression: bool,
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

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
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

    /// Log to file path (optional)
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_volume_name() -> String {
    "vol0".to_string()
}

fn default_volume_size() -> u64 {
    1024 * 1024 * 1024
}

fn default_block_size() -> u32 {
    4096
}

fn default_write_quorum() -> usize {
    1
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    10000
}

fn default_sync_timeout_ms() -> u64 {
    600_000
}

fn default_batch_blocks() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:9501".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfblock")
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            name: default_volume_name(),
            size: default_volume_size(),
            block_size: default_block_size(),
            write_quorum: default_write_quorum(),
            replicas: Vec::new(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            sync_timeout_ms: default_sync_timeout_ms(),
            rebuild_on_start: true,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_blocks: default_batch_blocks(),
            compression: true,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl ControllerConfig {
    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Get layer transfer timeout as Duration
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}

impl VolumeConfig {
    /// Validate volume geometry
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.is_empty() {
            return Err(crate::Error::Config("volume.name cannot be empty".into()));
        }

        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(crate::Error::Config(format!(
                "volume.block_size must be a power of two, got {}",
                self.block_size
            )));
        }

        if self.size == 0 || self.size % self.block_size as u64 != 0 {
            return Err(crate::Error::Config(format!(
                "volume.size {} must be a non-zero multiple of block_size {}",
                self.size, self.block_size
            )));
        }

        if self.write_quorum == 0 {
            return Err(crate::Error::Config("volume.write_quorum must be at least 1".into()));
        }

        Ok(())
    }
}

impl WolfBlockConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfBlockConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfBlockConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.sync.batch_blocks == 0 {
            return Err(crate::Error::Config("sync.batch_blocks must be at least 1".into()));
        }

        self.volume.validate()
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the replica chain directory path
    pub fn replica_dir(&self) -> PathBuf {
        self.node.data_dir.join("replica")
    }

    /// Get the backup directory path
    pub fn backup_dir(&self) -> PathBuf {
        self.node.data_dir.join("backups")
    }
}
