use backup_engine::{ArchiveMetadata, BackupError, BackupOptions, ErrorKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Schedule ──

/// A persisted schedule: what to back up and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,
    pub options: BackupOptions,
    pub cron: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_result: Option<RunOutcome>,
}

fn default_enabled() -> bool {
    true
}

impl Schedule {
    pub fn new(id: impl Into<String>, options: BackupOptions, cron: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            options,
            cron: cron.into(),
            enabled: true,
            last_run_at: None,
            last_result: None,
        }
    }
}

/// Result of the most recent dispatched run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum RunOutcome {
    #[serde(rename_all = "camelCase")]
    Ok { archive_id: String },
    #[serde(rename_all = "camelCase")]
    Failed { kind: ErrorKind, error: String },
}

impl RunOutcome {
    pub fn from_result(result: &Result<ArchiveMetadata, BackupError>) -> Self {
        match result {
            Ok(metadata) => RunOutcome::Ok {
                archive_id: metadata.id.clone(),
            },
            Err(e) => RunOutcome::Failed {
                kind: e.kind(),
                error: e.to_string(),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, RunOutcome::Ok { .. })
    }
}

// ── ScheduleView ──

/// Point-in-time snapshot of a schedule for callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleView {
    #[serde(flatten)]
    pub schedule: Schedule,
    pub running: bool,
    /// Next cron occurrence; `None` while disabled
    pub next_run_at: Option<DateTime<Utc>>,
}
