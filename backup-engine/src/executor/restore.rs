//! Restore an archive into a target directory.

use super::BackupService;
use crate::archive::metadata::{is_safe_relative_path, native_path};
use crate::archive::FileRecord;
use crate::fs::metadata::set_modified_at;
use crate::storage::ArchiveReader;
use crate::utils::errors::{BackupError, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSummary {
    pub archive_id: String,
    pub files_restored: u64,
    pub bytes_restored: u64,
}

fn restore_error(path: impl Into<String>, detail: impl ToString) -> BackupError {
    BackupError::Restore {
        path: path.into(),
        detail: detail.to_string(),
    }
}

impl BackupService {
    /// Restore every record of archive `id` under `target_dir`, in metadata
    /// order. Files already restored stay in place when a later one fails.
    pub async fn restore(&self, id: &str, target_dir: &Path) -> Result<RestoreSummary> {
        let reader = match self.store.open_reader(id).await {
            Ok(reader) => reader,
            Err(e @ BackupError::NotFound(_)) => return Err(e),
            Err(e) => return Err(restore_error(id, e)),
        };

        tokio::fs::create_dir_all(target_dir)
            .await
            .map_err(|e| restore_error(target_dir.display().to_string(), e))?;

        info!(archive_id = %id, target = %target_dir.display(), "Starting restore");

        let mut summary = RestoreSummary {
            archive_id: id.to_string(),
            files_restored: 0,
            bytes_restored: 0,
        };

        for record in reader.list_files() {
            if !is_safe_relative_path(&record.path) {
                return Err(restore_error(&record.path, "unsafe path in archive metadata"));
            }
            let dest = native_path(target_dir, &record.path);

            if record.is_directory {
                tokio::fs::create_dir_all(&dest)
                    .await
                    .map_err(|e| restore_error(&record.path, e))?;
                apply_modified_at(&dest, &record);
                continue;
            }

            let bytes = restore_file(reader.as_ref(), &record, &dest).await?;
            set_modified_at(&dest, record.modified_at).map_err(|e| restore_error(&record.path, e))?;

            summary.files_restored += 1;
            summary.bytes_restored += bytes;
        }

        info!(
            archive_id = %id,
            files = summary.files_restored,
            bytes = summary.bytes_restored,
            "Restore complete"
        );
        Ok(summary)
    }
}

/// Stream one record through a temporary sibling, then rename it over `dest`.
async fn restore_file(reader: &dyn ArchiveReader, record: &FileRecord, dest: &Path) -> Result<u64> {
    let parent = dest.parent().map(Path::to_path_buf).unwrap_or_default();
    tokio::fs::create_dir_all(&parent)
        .await
        .map_err(|e| restore_error(&record.path, e))?;

    let (mut content, _) = reader
        .open_file(&record.path)
        .await
        .map_err(|e| restore_error(&record.path, e))?;

    let temp_path = temp_sibling(dest);
    let copied = async {
        let mut file = tokio::fs::File::create(&temp_path).await?;
        let bytes = tokio::io::copy(&mut content, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok::<u64, std::io::Error>(bytes)
    }
    .await;

    let bytes = match copied {
        Ok(bytes) => bytes,
        Err(e) => {
            if let Err(cleanup_err) = tokio::fs::remove_file(&temp_path).await {
                debug!(path = %temp_path.display(), error = %cleanup_err, "Failed to remove partial restore file");
            }
            return Err(restore_error(&record.path, e));
        }
    };

    tokio::fs::rename(&temp_path, dest)
        .await
        .map_err(|e| restore_error(&record.path, e))?;

    debug!(path = %record.path, bytes, "Restored file");
    Ok(bytes)
}

fn temp_sibling(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let token = uuid::Uuid::new_v4().simple().to_string();
    dest.with_file_name(format!(".{}.restore-{}", name, &token[..8]))
}

/// Directory times are advisory; creating children afterwards moves them anyway.
fn apply_modified_at(path: &Path, record: &FileRecord) {
    if let Err(e) = set_modified_at(path, record.modified_at) {
        warn!(path = %record.path, error = %e, "Failed to apply modification time");
    }
}
