//! Re-hash stored content and compare it against the recorded digests.

use super::BackupService;
use crate::transfer::HashingReader;
use crate::utils::errors::{BackupError, Result};
use serde::Serialize;
use std::io;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySummary {
    pub archive_id: String,
    pub files_verified: u64,
    pub bytes_verified: u64,
}

fn integrity_error(path: &str, detail: impl Into<String>) -> BackupError {
    BackupError::Integrity {
        path: path.to_string(),
        detail: detail.into(),
    }
}

impl BackupService {
    /// Check every file of archive `id`. Stops at the first record whose
    /// content does not match its metadata.
    pub async fn verify(&self, id: &str) -> Result<VerifySummary> {
        let reader = self.store.open_reader(id).await?;
        let mut summary = VerifySummary {
            archive_id: id.to_string(),
            files_verified: 0,
            bytes_verified: 0,
        };

        for record in reader.list_files().into_iter().filter(|r| !r.is_directory) {
            let Some(expected) = record.hash.as_deref() else {
                return Err(integrity_error(&record.path, "no hash recorded"));
            };

            let content = match reader.open_file(&record.path).await {
                Ok((content, _)) => content,
                Err(BackupError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                    warn!(archive_id = %id, path = %record.path, "Archived content is missing");
                    return Err(integrity_error(&record.path, "content missing from archive"));
                }
                Err(e) => return Err(e),
            };

            let mut hashing = HashingReader::new(content);
            tokio::io::copy(&mut hashing, &mut tokio::io::sink())
                .await
                .map_err(|e| BackupError::read(&record.path, e))?;
            let (actual, bytes) = hashing.finish();

            if actual != expected {
                warn!(archive_id = %id, path = %record.path, "Hash mismatch");
                return Err(integrity_error(
                    &record.path,
                    format!("hash mismatch: expected {}, found {}", expected, actual),
                ));
            }
            if bytes != record.size {
                warn!(archive_id = %id, path = %record.path, "Size mismatch");
                return Err(integrity_error(
                    &record.path,
                    format!("size mismatch: expected {}, found {}", record.size, bytes),
                ));
            }

            summary.files_verified += 1;
            summary.bytes_verified += bytes;
        }

        info!(
            archive_id = %id,
            files = summary.files_verified,
            bytes = summary.bytes_verified,
            "Archive verified"
        );
        Ok(summary)
    }
}
