//! Tunables for the backup engine.
//!
//! Embedded in the daemon's TOML configuration under `[engine]`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Retention applied when backup options leave it unset (0 = keep forever)
    #[serde(default = "default_retention_days")]
    pub default_retention_days: u32,

    /// Deadline for a single archive run in seconds (0 = no deadline)
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    /// Minimum age before an unpublished archive directory may be swept
    #[serde(default = "default_orphan_grace_secs")]
    pub orphan_grace_secs: u64,

    /// Streaming buffer size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

// Default values
fn default_retention_days() -> u32 {
    30
}

fn default_run_timeout_secs() -> u64 {
    60 * 60 // 1 hour
}

fn default_orphan_grace_secs() -> u64 {
    60 * 60
}

fn default_chunk_size() -> usize {
    64 * 1024 // 64KB
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_retention_days: default_retention_days(),
            run_timeout_secs: default_run_timeout_secs(),
            orphan_grace_secs: default_orphan_grace_secs(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl EngineSettings {
    pub fn run_timeout(&self) -> Option<Duration> {
        (self.run_timeout_secs > 0).then(|| Duration::from_secs(self.run_timeout_secs))
    }

    pub fn orphan_grace(&self) -> chrono::Duration {
        let secs = i64::try_from(self.orphan_grace_secs)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1000);
        chrono::Duration::seconds(secs)
    }
}
