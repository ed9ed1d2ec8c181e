//! Retention sweep: expired archives plus abandoned partial archives.

use super::BackupService;
use crate::utils::errors::{ErrorKind, Result};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupFailure {
    pub id: String,
    pub kind: ErrorKind,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    /// Archives removed because their retention ran out
    pub expired: Vec<String>,
    /// Unpublished directories removed
    pub orphans: Vec<String>,
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

impl BackupService {
    /// Delete every archive whose retention has run out at the current
    /// clock time, then sweep orphans older than the grace period. A failed
    /// deletion is recorded and the sweep moves on.
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        let now = self.clock.now();
        let mut report = CleanupReport::default();

        for archive in self.store.list().await? {
            if !archive.is_expired(now) {
                continue;
            }
            match self.store.delete(&archive.id).await {
                Ok(()) => {
                    info!(
                        archive_id = %archive.id,
                        created_at = %archive.created_at,
                        retention_days = archive.retention_days,
                        "Deleted expired archive"
                    );
                    report.expired.push(archive.id);
                }
                Err(e) => {
                    warn!(archive_id = %archive.id, error = %e, "Failed to delete expired archive");
                    report.failures.push(CleanupFailure {
                        id: archive.id,
                        kind: e.kind(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if let Some(cutoff) = now.checked_sub_signed(self.settings.orphan_grace()) {
            match self.store.sweep_orphans(cutoff).await {
                Ok(orphans) => {
                    if !orphans.is_empty() {
                        info!(count = orphans.len(), "Swept orphaned archive directories");
                    }
                    report.orphans = orphans;
                }
                Err(e) => {
                    warn!(error = %e, "Orphan sweep failed");
                    report.failures.push(CleanupFailure {
                        id: String::new(),
                        kind: e.kind(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }
}
