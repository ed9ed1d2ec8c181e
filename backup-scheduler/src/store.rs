//! JSON persistence for the schedule registry.
//!
//! The whole registry is one document, `{ "schedules": [...] }`, rewritten on
//! every mutation through a temporary file and a rename.

use crate::models::schedule::Schedule;
use backup_engine::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateDocument {
    #[serde(default)]
    schedules: Vec<Schedule>,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the registry. A missing file is an empty registry.
    pub async fn load(&self) -> Result<Vec<Schedule>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No schedule state yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(self.backend_error("read", e)),
        };

        let document: StateDocument = serde_json::from_slice(&bytes)
            .map_err(|e| BackupError::Backend(format!("malformed schedule state {}: {}", self.path.display(), e)))?;
        Ok(document.schedules)
    }

    /// Replace the registry with `schedules`.
    pub async fn save(&self, schedules: &[Schedule]) -> Result<()> {
        let document = StateDocument {
            schedules: schedules.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&document)
            .map_err(|e| BackupError::Backend(format!("failed to serialize schedule state: {}", e)))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.backend_error("create directory for", e))?;
        }

        let token = uuid::Uuid::new_v4().simple().to_string();
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "schedules.json".to_string());
        let temp_path = self.path.with_file_name(format!(".{}.tmp-{}", file_name, &token[..8]));

        let written = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(&json).await?;
            file.sync_all().await?;
            tokio::fs::rename(&temp_path, &self.path).await
        }
        .await;

        if let Err(e) = written {
            if let Err(cleanup_err) = tokio::fs::remove_file(&temp_path).await {
                debug!(path = %temp_path.display(), error = %cleanup_err, "Failed to remove temporary state file");
            }
            return Err(self.backend_error("write", e));
        }
        Ok(())
    }

    fn backend_error(&self, action: &str, e: io::Error) -> BackupError {
        BackupError::Backend(format!("failed to {} schedule state {}: {}", action, self.path.display(), e))
    }
}
