use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Top-level config (cronlock.toml + CRONLOCK_* env overrides).
///
/// Nested keys are separated by a double underscore in the environment,
/// e.g. `CRONLOCK_SCHEDULER__LOCK_TIMEOUT_SECS=300`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronlockConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a connection waits on SQLite's write lock before giving up.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Age after which another poller may take over a held lock.
    ///
    /// Unset means a lock never expires: a worker that dies while holding a
    /// claim leaves that job unclaimable until an operator clears the lock.
    #[serde(default)]
    pub lock_timeout_secs: Option<u64>,
    /// Pause between passes in `cronlock-worker run`.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Overrides the host name recorded on execution logs.
    #[serde(default)]
    pub node: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: None,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            node: None,
        }
    }
}

impl SchedulerConfig {
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_secs.map(Duration::from_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn node_name(&self) -> String {
        self.node
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(crate::node::current_node)
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cronlock/cronlock.db", home)
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

impl CronlockConfig {
    /// Load config from a TOML file with CRONLOCK_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.cronlock/cronlock.toml
    ///
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("CRONLOCK_").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        figment
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cronlock/cronlock.toml", home)
}

/// Create the parent directory of `path` if it does not exist yet.
pub fn ensure_parent_dir(path: &str) -> Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!(path = %parent.display(), "created database directory");
        }
    }
    Ok(())
}
