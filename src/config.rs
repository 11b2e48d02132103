//! Configuration for stores, the daemon, and the optional YAML config file.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory holding the database, config file, socket and PID file.
pub const STORE_DIR: &str = ".initiative";

/// SQLite database file.
pub const DB_FILE: &str = "initiative.db";

/// Optional YAML config file within the store directory.
pub const CONFIG_FILE: &str = "initiative.yaml";

/// How long a connection waits on a held lock before giving up.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// In-progress tasks untouched for this long are presumed abandoned.
pub const DEFAULT_STALE_TIMEOUT_SECS: u64 = 30 * 60;

/// How often the daemon sweeps for stale claims.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Settings needed to open a store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Path of the SQLite database file
    pub db_path: PathBuf,

    /// Upper bound on lock waits; beyond it operations fail as retryable
    pub busy_timeout: Duration,
}

impl StoreConfig {
    /// Config for an explicit database path with default timeouts.
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }

    /// Config for the default database under `root/.initiative`.
    pub fn for_root(root: &Path) -> Self {
        Self::new(root.join(STORE_DIR).join(DB_FILE))
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }
}

/// Contents of `initiative.yaml`. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Database path; relative paths resolve against the store root
    pub db_path: Option<PathBuf>,
    pub busy_timeout_ms: Option<u64>,
    pub stale_timeout_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
}

impl FileConfig {
    /// Load a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path.display()))?;
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&text).with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Load `root/.initiative/initiative.yaml` if present.
    pub fn discover(root: &Path) -> Result<Self> {
        let path = root.join(STORE_DIR).join(CONFIG_FILE);
        if path.exists() {
            log::debug!("Loading config from {}", path.display());
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Store settings for the given root.
    pub fn store_config(&self, root: &Path) -> StoreConfig {
        let db_path = match &self.db_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => root.join(path),
            None => root.join(STORE_DIR).join(DB_FILE),
        };
        let mut config = StoreConfig::new(db_path);
        if let Some(ms) = self.busy_timeout_ms {
            config = config.busy_timeout(Duration::from_millis(ms));
        }
        config
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs.unwrap_or(DEFAULT_STALE_TIMEOUT_SECS))
    }

    /// Sweep period, at least one second.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS).max(1))
    }
}
