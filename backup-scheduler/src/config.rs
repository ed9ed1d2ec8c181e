//! Configuration for the scheduler daemon.
//!
//! Loads configuration from a TOML file with environment variable overrides.

use anyhow::Context;
use backup_engine::archive::options::MAX_RETENTION_DAYS;
use backup_engine::EngineSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one subdirectory per archive
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// JSON document holding the schedule registry
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// How long in-flight backups may run after a shutdown signal
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also append logs to this file
    #[serde(default)]
    pub file: Option<PathBuf>,
}

// Default values
fn default_base_dir() -> PathBuf {
    PathBuf::from("/var/lib/backup/archives")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/var/lib/backup/schedules.json")
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl SchedulerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// File (or defaults), then `.env`, then process environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `BACKUP_BASE_DIR`, `BACKUP_STATE_FILE`, `BACKUP_RETENTION_DAYS`,
    /// `LOG_LEVEL` and `BACKUP_LOG_FILE`.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("BACKUP_BASE_DIR") {
            self.storage.base_dir = PathBuf::from(dir);
        }
        if let Some(file) = lookup("BACKUP_STATE_FILE") {
            self.scheduler.state_file = PathBuf::from(file);
        }
        if let Some(days) = lookup("BACKUP_RETENTION_DAYS") {
            self.engine.default_retention_days = days
                .trim()
                .parse()
                .with_context(|| format!("BACKUP_RETENTION_DAYS must be a whole number of days, got '{}'", days))?;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log.level = level;
        }
        if let Some(file) = lookup("BACKUP_LOG_FILE") {
            self.log.file = Some(PathBuf::from(file));
        }

        anyhow::ensure!(
            self.engine.default_retention_days <= MAX_RETENTION_DAYS,
            "default retention of {} days exceeds the maximum of {}",
            self.engine.default_retention_days,
            MAX_RETENTION_DAYS
        );
        Ok(())
    }
}
