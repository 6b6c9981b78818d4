use serde::{Deserialize, Serialize};
use shardsync_core::{AllocationConfig, Result, SyncError};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub allocation: AllocationConfig,
    pub sync: SyncConfig,
}

/// Local side of the sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub local_root: PathBuf,
    pub snapshot_path: PathBuf,
    #[serde(default = "default_local_filters")]
    pub local_filters: Vec<String>,
    #[serde(default)]
    pub remote_excludes: Vec<String>,
}

fn default_local_filters() -> Vec<String> {
    vec![".DS_Store".to_string(), ".git".to_string()]
}

impl Config {
    /// Reads `path` and applies `SHARDSYNC_*` environment overrides, with
    /// `__` separating nested keys.
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("SHARDSYNC").separator("__"))
            .build()
            .map_err(|e| SyncError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| SyncError::Config(e.to_string()))?;

        Ok(config)
    }
}
