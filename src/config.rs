//! Runtime configuration, read from TOML and overridable from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionInfo;
use crate::sync_error::{Result, SyncError};

pub const ENV_DATA_DIR: &str = "FIELD_SYNC_DATA_DIR";
pub const ENV_DIRECTORY_PROTOCOL: &str = "FIELD_SYNC_DIRECTORY_PROTOCOL";
pub const ENV_DIRECTORY_HOST: &str = "FIELD_SYNC_DIRECTORY_HOST";
pub const ENV_DIRECTORY_PORT: &str = "FIELD_SYNC_DIRECTORY_PORT";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Parent directory of every LMDB environment
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Where the directory of listings lives
    #[serde(default)]
    pub directory: ConnectionInfo,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub staging: StagingConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// When false no remote is ever contacted
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Upper bound for one replication pass, in seconds
    #[serde(default = "default_replication_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Period of the staging save cycle, in milliseconds
    #[serde(default = "default_save_interval")]
    pub save_interval_ms: u64,

    /// Consecutive failed saves before the session reports an error
    #[serde(default = "default_max_errors")]
    pub max_consecutive_errors: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// LMDB map size per database, in MiB
    #[serde(default = "default_map_size")]
    pub map_size_mb: usize,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./field_sync_data")
}
fn default_true() -> bool {
    true
}
fn default_replication_timeout() -> u64 {
    30
}
fn default_save_interval() -> u64 {
    5000
}
fn default_max_errors() -> u32 {
    5
}
fn default_map_size() -> usize {
    64
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            directory: ConnectionInfo::default(),
            replication: ReplicationConfig::default(),
            staging: StagingConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_replication_timeout(),
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            save_interval_ms: default_save_interval(),
            max_consecutive_errors: default_max_errors(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            map_size_mb: default_map_size(),
        }
    }
}

impl SyncConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SyncError::ConfigError(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Applies `FIELD_SYNC_*` variables on top of the current values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub(crate) fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(proto) = lookup(ENV_DIRECTORY_PROTOCOL) {
            self.directory.proto = proto;
        }
        if let Some(host) = lookup(ENV_DIRECTORY_HOST) {
            self.directory.host = host;
        }
        if let Some(port) = lookup(ENV_DIRECTORY_PORT) {
            self.directory.port = port
                .parse()
                .map_err(|_| SyncError::ConfigError(format!("{ENV_DIRECTORY_PORT}={port} is not a valid port")))?;
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.directory.host.is_empty() {
            return Err(SyncError::ConfigError("directory.host cannot be empty".to_string()));
        }
        if self.directory.db_name.is_empty() {
            return Err(SyncError::ConfigError("directory.db_name cannot be empty".to_string()));
        }
        if self.staging.save_interval_ms == 0 {
            return Err(SyncError::ConfigError("staging.save_interval_ms must be positive".to_string()));
        }
        if self.staging.max_consecutive_errors == 0 {
            return Err(SyncError::ConfigError(
                "staging.max_consecutive_errors must be positive".to_string(),
            ));
        }
        if self.storage.map_size_mb == 0 {
            return Err(SyncError::ConfigError("storage.map_size_mb must be positive".to_string()));
        }
        Ok(())
    }

    pub fn replication_timeout(&self) -> Duration {
        Duration::from_secs(self.replication.timeout_secs)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.staging.save_interval_ms)
    }

    pub fn map_size_bytes(&self) -> usize {
        self.storage.map_size_mb * 1024 * 1024
    }
}
