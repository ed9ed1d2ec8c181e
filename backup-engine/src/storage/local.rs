//! Local filesystem archive storage.
//!
//! Layout under the base directory:
//!
//! ```text
//! <base>/
//!   <archive-id>/
//!     metadata.json
//!     <file tree mirroring source paths>
//! ```
//!
//! Files land under a temporary name and are renamed into place once fully
//! written. `metadata.json` is staged as `.metadata.json.partial` by
//! `commit_metadata` and renamed by `close`, which is the single step that
//! publishes an archive. Deletion first renames the archive directory to a
//! hidden `.trash-*` name so it vanishes from listings in one step.

use super::{ArchiveReader, ArchiveStore, ArchiveWriter, ContentStream};
use crate::archive::metadata::{is_safe_relative_path, native_path};
use crate::archive::{ArchiveMetadata, FileRecord};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info, warn};

pub const METADATA_FILE: &str = "metadata.json";
const STAGED_METADATA_FILE: &str = ".metadata.json.partial";
const TRASH_PREFIX: &str = ".trash-";

/// Archive storage rooted at a local directory
#[derive(Clone)]
pub struct LocalStorage {
    base_dir: PathBuf,
    /// Archives with a writer alive in this process; never swept
    live_writers: Arc<DashSet<String>>,
}

impl LocalStorage {
    /// Open (creating if needed) storage under `base_dir`
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        tokio::fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| BackupError::write(&base_dir, e))?;

        Ok(Self {
            base_dir,
            live_writers: Arc::new(DashSet::new()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn archive_dir(&self, id: &str) -> Option<PathBuf> {
        is_valid_archive_id(id).then(|| self.base_dir.join(id))
    }
}

/// Archive ids must be a single visible path component.
fn is_valid_archive_id(id: &str) -> bool {
    !id.is_empty() && !id.starts_with('.') && !id.contains(['/', '\\', '\0'])
}

fn short_token() -> String {
    let token = uuid::Uuid::new_v4().simple().to_string();
    token[..8].to_string()
}

async fn read_metadata(dir: &Path) -> io::Result<ArchiveMetadata> {
    let bytes = tokio::fs::read(dir.join(METADATA_FILE)).await?;
    serde_json::from_slice(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn modified_at(path: &Path) -> io::Result<DateTime<Utc>> {
    let metadata = tokio::fs::metadata(path).await?;
    Ok(DateTime::<Utc>::from(metadata.modified()?))
}

#[async_trait]
impl ArchiveStore for LocalStorage {
    async fn create_writer(&self, draft: &ArchiveMetadata) -> Result<Box<dyn ArchiveWriter>> {
        let dir = self
            .archive_dir(&draft.id)
            .ok_or_else(|| BackupError::InvalidOption(format!("invalid archive id '{}'", draft.id)))?;

        match tokio::fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(BackupError::Backend(format!("archive id {} already exists", draft.id)));
            }
            Err(e) => return Err(BackupError::write(&dir, e)),
        }

        self.live_writers.insert(draft.id.clone());
        debug!(archive_id = %draft.id, path = %dir.display(), "Reserved archive directory");

        Ok(Box::new(LocalArchiveWriter {
            id: draft.id.clone(),
            dir,
            staged: false,
            live_writers: Arc::clone(&self.live_writers),
        }))
    }

    async fn open_reader(&self, id: &str) -> Result<Box<dyn ArchiveReader>> {
        let dir = self
            .archive_dir(id)
            .ok_or_else(|| BackupError::NotFound(format!("archive {}", id)))?;

        let metadata = match read_metadata(&dir).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BackupError::NotFound(format!("archive {}", id)));
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!(archive_id = %id, error = %e, "Archive metadata is malformed");
                return Err(BackupError::NotFound(format!("archive {}", id)));
            }
            Err(e) => return Err(BackupError::read(dir.join(METADATA_FILE), e)),
        };

        let index = metadata
            .files
            .iter()
            .enumerate()
            .map(|(i, record)| (record.path.clone(), i))
            .collect();

        Ok(Box::new(LocalArchiveReader { dir, metadata, index }))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let dir = self
            .archive_dir(id)
            .ok_or_else(|| BackupError::InvalidOption(format!("invalid archive id '{}'", id)))?;

        let trash = self.base_dir.join(format!("{}{}-{}", TRASH_PREFIX, id, short_token()));
        match tokio::fs::rename(&dir, &trash).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(BackupError::Backend(format!("failed to delete archive {}: {}", id, e))),
        }

        // The archive is gone for readers; what remains is disk reclamation
        if let Err(e) = tokio::fs::remove_dir_all(&trash).await {
            warn!(archive_id = %id, path = %trash.display(), error = %e, "Failed to remove deleted archive contents");
        }

        info!(archive_id = %id, "Deleted archive");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ArchiveMetadata>> {
        let mut entries = tokio::fs::read_dir(&self.base_dir)
            .await
            .map_err(|e| BackupError::Backend(format!("failed to read storage directory: {}", e)))?;

        let mut archives = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BackupError::Backend(format!("failed to read storage directory: {}", e)))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !is_valid_archive_id(name) {
                continue;
            }
            match entry.file_type().await {
                Ok(file_type) if file_type.is_dir() => {}
                _ => continue,
            }

            match read_metadata(&entry.path()).await {
                Ok(metadata) if metadata.id == name => archives.push(metadata),
                Ok(metadata) => {
                    warn!(directory = %name, archive_id = %metadata.id, "Skipping archive whose metadata id does not match its directory");
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(directory = %name, "Skipping unpublished archive");
                }
                Err(e) => {
                    warn!(directory = %name, error = %e, "Skipping archive with unreadable metadata");
                }
            }
        }

        archives.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(archives)
    }

    async fn sweep_orphans(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.base_dir)
            .await
            .map_err(|e| BackupError::Backend(format!("failed to read storage directory: {}", e)))?;

        let mut removed = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BackupError::Backend(format!("failed to read storage directory: {}", e)))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let path = entry.path();

            match entry.file_type().await {
                Ok(file_type) if file_type.is_dir() => {}
                _ => continue,
            }

            let is_trash = name.starts_with(TRASH_PREFIX);
            if !is_trash {
                if !is_valid_archive_id(&name) || self.live_writers.contains(&name) {
                    continue;
                }
                if tokio::fs::try_exists(path.join(METADATA_FILE)).await.unwrap_or(true) {
                    continue;
                }
                match modified_at(&path).await {
                    Ok(modified) if modified <= cutoff => {}
                    _ => continue,
                }
            }

            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {
                    info!(directory = %name, "Removed orphaned archive directory");
                    removed.push(name);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(directory = %name, error = %e, "Failed to remove orphaned archive directory");
                }
            }
        }

        Ok(removed)
    }
}

/// Writer for one archive directory. Dropping it without `close` leaves the
/// directory unpublished.
pub struct LocalArchiveWriter {
    id: String,
    dir: PathBuf,
    staged: bool,
    live_writers: Arc<DashSet<String>>,
}

impl LocalArchiveWriter {
    fn reserved(path: &str) -> bool {
        path == METADATA_FILE || path == STAGED_METADATA_FILE
    }
}

impl Drop for LocalArchiveWriter {
    fn drop(&mut self) {
        self.live_writers.remove(&self.id);
    }
}

#[async_trait]
impl ArchiveWriter for LocalArchiveWriter {
    fn archive_id(&self) -> &str {
        &self.id
    }

    async fn add_file(&mut self, record: &FileRecord, content: &mut (dyn AsyncRead + Send + Unpin)) -> Result<u64> {
        if !is_safe_relative_path(&record.path) {
            return Err(BackupError::write(
                &record.path,
                io::Error::new(io::ErrorKind::InvalidInput, "record path must be relative without '..'"),
            ));
        }
        if Self::reserved(&record.path) {
            return Err(BackupError::write(
                &record.path,
                io::Error::new(io::ErrorKind::AlreadyExists, "name is reserved for archive metadata"),
            ));
        }

        let dest = native_path(&self.dir, &record.path);
        if record.is_directory {
            tokio::fs::create_dir_all(&dest)
                .await
                .map_err(|e| BackupError::write(&dest, e))?;
            return Ok(0);
        }

        let parent = dest.parent().unwrap_or(&self.dir).to_path_buf();
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| BackupError::write(&parent, e))?;

        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let temp_path = parent.join(format!(".{}.partial-{}", file_name, short_token()));

        let written = match stream_to_file(content, &temp_path).await {
            Ok(written) => written,
            Err(e) => {
                if let Err(cleanup_err) = tokio::fs::remove_file(&temp_path).await {
                    debug!(path = %temp_path.display(), error = %cleanup_err, "Failed to remove partial file");
                }
                return Err(BackupError::write(&dest, e));
            }
        };

        tokio::fs::rename(&temp_path, &dest)
            .await
            .map_err(|e| BackupError::write(&dest, e))?;

        Ok(written)
    }

    async fn commit_metadata(&mut self, metadata: &ArchiveMetadata) -> Result<()> {
        if metadata.id != self.id {
            return Err(BackupError::Backend(format!(
                "metadata for {} cannot be committed to archive {}",
                metadata.id, self.id
            )));
        }

        let json = serde_json::to_vec_pretty(metadata)
            .map_err(|e| BackupError::Backend(format!("failed to serialize metadata: {}", e)))?;

        let staged = self.dir.join(STAGED_METADATA_FILE);
        let mut file = tokio::fs::File::create(&staged)
            .await
            .map_err(|e| BackupError::write(&staged, e))?;
        file.write_all(&json).await.map_err(|e| BackupError::write(&staged, e))?;
        file.sync_all().await.map_err(|e| BackupError::write(&staged, e))?;

        self.staged = true;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        if !self.staged {
            debug!(archive_id = %self.id, "Closing archive without metadata, nothing published");
            return Ok(());
        }

        let staged = self.dir.join(STAGED_METADATA_FILE);
        let published = self.dir.join(METADATA_FILE);
        tokio::fs::rename(&staged, &published)
            .await
            .map_err(|e| BackupError::write(&published, e))?;

        debug!(archive_id = %self.id, "Published archive");
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        if self.staged {
            let staged = self.dir.join(STAGED_METADATA_FILE);
            if let Err(e) = tokio::fs::remove_file(&staged).await {
                debug!(archive_id = %self.id, error = %e, "Failed to remove staged metadata");
            }
        }
        debug!(archive_id = %self.id, "Aborted archive, nothing published");
    }
}

async fn stream_to_file(content: &mut (dyn AsyncRead + Send + Unpin), path: &Path) -> io::Result<u64> {
    let mut file = tokio::fs::File::create(path).await?;
    let written = tokio::io::copy(content, &mut file).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

/// Reader over a published archive directory
pub struct LocalArchiveReader {
    dir: PathBuf,
    metadata: ArchiveMetadata,
    index: HashMap<String, usize>,
}

#[async_trait]
impl ArchiveReader for LocalArchiveReader {
    fn metadata(&self) -> &ArchiveMetadata {
        &self.metadata
    }

    async fn open_file(&self, path: &str) -> Result<(ContentStream, FileRecord)> {
        let record = self
            .index
            .get(path)
            .map(|&i| self.metadata.files[i].clone())
            .ok_or_else(|| BackupError::NotFound(format!("{} in archive {}", path, self.metadata.id)))?;

        if !is_safe_relative_path(&record.path) {
            return Err(BackupError::read(
                &record.path,
                io::Error::new(io::ErrorKind::InvalidData, "unsafe path in archive metadata"),
            ));
        }

        if record.is_directory {
            return Ok((Box::new(tokio::io::empty()), record));
        }

        let file_path = native_path(&self.dir, &record.path);
        let file = tokio::fs::File::open(&file_path)
            .await
            .map_err(|e| BackupError::read(&file_path, e))?;

        Ok((Box::new(file), record))
    }
}
