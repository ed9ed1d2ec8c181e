//! Backup engine - creates, restores, verifies and expires archives.
//!
//! A run walks the source tree once and streams every file straight into the
//! storage writer through a hashing reader, so nothing is buffered whole and
//! every byte is read exactly once. Any failure abandons the archive and
//! removes whatever was written.

pub mod cancel;
mod restore;
mod retention;
mod verify;

#[cfg(test)]
mod scenarios;

use crate::archive::metadata::generate_archive_id;
use crate::archive::options::{self, BackupOptions, ValidatedOptions};
use crate::archive::{ArchiveMetadata, FileRecord};
use crate::clock::Clock;
use crate::config::EngineSettings;
use crate::fs::walker::{walk_directory_until, FileInfo, WalkOptions};
use crate::storage::{ArchiveStore, ArchiveWriter};
use crate::transfer::HashingReader;
use crate::utils::errors::{BackupError, Result};
use cancel::RunControl;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use restore::RestoreSummary;
pub use retention::{CleanupFailure, CleanupReport};
pub use verify::VerifySummary;

/// Archive engine over one storage backend
pub struct BackupService {
    store: Arc<dyn ArchiveStore>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
}

impl BackupService {
    pub fn new(store: Arc<dyn ArchiveStore>, clock: Arc<dyn Clock>, settings: EngineSettings) -> Self {
        Self { store, clock, settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Validate options without side effects on storage
    pub async fn validate_options(&self, options: &BackupOptions) -> Result<ValidatedOptions> {
        let options = options.clone();
        tokio::task::spawn_blocking(move || options::validate(&options))
            .await
            .map_err(|e| BackupError::Backend(format!("validation task failed: {}", e)))?
    }

    /// Create an archive (no external cancellation)
    pub async fn create(&self, options: &BackupOptions) -> Result<ArchiveMetadata> {
        self.create_with_cancel(options, CancellationToken::new()).await
    }

    /// Create an archive, abandoning it when `cancel_token` fires or the
    /// configured run deadline passes
    pub async fn create_with_cancel(&self, options: &BackupOptions, cancel_token: CancellationToken) -> Result<ArchiveMetadata> {
        let validated = self.validate_options(options).await?;
        let control = RunControl::new(cancel_token, self.settings.run_timeout());

        let created_at = self.clock.now();
        let retention_days = validated
            .retention_days
            .unwrap_or(self.settings.default_retention_days);
        let mut metadata = ArchiveMetadata::draft(
            generate_archive_id(created_at),
            validated.kind,
            validated.source_root.clone(),
            validated.destination.display().to_string(),
            created_at,
            validated.exclude_rules.clone(),
            retention_days,
        );
        let archive_id = metadata.id.clone();

        info!(
            archive_id = %archive_id,
            kind = %metadata.kind,
            source = %validated.source_root.display(),
            "Starting archive"
        );
        let start_time = std::time::Instant::now();

        control.check()?;
        let writer = match control.run(self.store.create_writer(&metadata)).await {
            Ok(writer) => writer,
            Err(e) => {
                log_failure(&archive_id, &e);
                // A reservation may have landed before the cancel won the race
                if matches!(e, BackupError::Cancelled) {
                    self.discard(&archive_id).await;
                }
                return Err(e);
            }
        };

        if let Err(e) = self.write_archive(&mut metadata, writer, &validated, &control).await {
            log_failure(&archive_id, &e);
            self.discard(&archive_id).await;
            return Err(e);
        }

        info!(
            archive_id = %archive_id,
            files = metadata.file_count,
            bytes = metadata.total_size,
            duration_ms = start_time.elapsed().as_millis() as u64,
            "Archive created"
        );

        if metadata.retention_days > 0 {
            match self.cleanup().await {
                Ok(report) if !report.failures.is_empty() => {
                    warn!(failures = report.failures.len(), "Retention cleanup finished with failures");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Retention cleanup failed"),
            }
        }

        Ok(metadata)
    }

    /// Fill, commit and publish a reserved archive. Failures abort the writer,
    /// so nothing is published even after metadata was committed.
    async fn write_archive(
        &self,
        metadata: &mut ArchiveMetadata,
        mut writer: Box<dyn ArchiveWriter>,
        validated: &ValidatedOptions,
        control: &RunControl,
    ) -> Result<()> {
        let filled = match self.fill(metadata, writer.as_mut(), validated, control).await {
            Ok(()) => control.run(writer.commit_metadata(metadata)).await,
            Err(e) => Err(e),
        };

        match filled.and_then(|()| control.check()) {
            Ok(()) => writer.close().await,
            Err(e) => {
                writer.abort().await;
                Err(e)
            }
        }
    }

    /// Stream every walked file into the writer, in walk order.
    async fn fill(
        &self,
        metadata: &mut ArchiveMetadata,
        writer: &mut dyn ArchiveWriter,
        validated: &ValidatedOptions,
        control: &RunControl,
    ) -> Result<()> {
        let root = validated.source_root.clone();
        let walk_options = WalkOptions {
            follow_links: false,
            exclude_rules: validated.exclude_rules.clone(),
        };
        let walk_control = control.clone();
        let files = tokio::task::spawn_blocking(move || {
            walk_directory_until(&root, &walk_options, || walk_control.is_cancelled())
        })
        .await
        .map_err(|e| BackupError::Backend(format!("walk task failed: {}", e)))??;

        debug!(archive_id = %metadata.id, files = files.len(), "Scanned source tree");

        for file in &files {
            control.check()?;
            let record = self.archive_file(file, writer, control).await?;
            metadata.push_file(record);
        }

        Ok(())
    }

    async fn archive_file(&self, file: &FileInfo, writer: &mut dyn ArchiveWriter, control: &RunControl) -> Result<FileRecord> {
        let source = tokio::fs::File::open(&file.path)
            .await
            .map_err(|e| BackupError::read(&file.path, e))?;
        let mut reader = HashingReader::new(BufReader::with_capacity(self.settings.chunk_size, source));
        let mut record = FileRecord::file(file.relative_path.clone(), file.size, file.modified_at);

        let stored = match control.run(writer.add_file(&record, &mut reader)).await {
            Ok(stored) => stored,
            // The writer wraps whatever failed; attribute it to the source when the read side broke
            Err(BackupError::Write { source, .. }) if reader.source_failed() => {
                return Err(BackupError::read(&file.path, source));
            }
            Err(e) => return Err(e),
        };

        let (hash, bytes_read) = reader.finish();
        if stored != bytes_read {
            return Err(BackupError::write(
                &file.relative_path,
                std::io::Error::other(format!("stored {} bytes but read {}", stored, bytes_read)),
            ));
        }
        if bytes_read != file.size {
            debug!(path = %file.relative_path, expected = file.size, actual = bytes_read, "File size changed while archiving");
        }

        record.size = bytes_read;
        record.hash = Some(hash);
        Ok(record)
    }

    /// Best-effort removal of an abandoned archive
    async fn discard(&self, archive_id: &str) {
        if let Err(e) = self.store.delete(archive_id).await {
            warn!(archive_id = %archive_id, error = %e, "Failed to remove partial archive");
        }
    }

    /// Published archives ordered by creation time, then id
    pub async fn list(&self) -> Result<Vec<ArchiveMetadata>> {
        self.store.list().await
    }

    pub async fn get_metadata(&self, id: &str) -> Result<ArchiveMetadata> {
        let reader = self.store.open_reader(id).await?;
        Ok(reader.metadata().clone())
    }

    /// Delete an archive. Deleting an unknown id succeeds.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.store.delete(id).await
    }
}

fn log_failure(archive_id: &str, e: &BackupError) {
    match e {
        BackupError::Cancelled => warn!(archive_id = %archive_id, "Archive cancelled"),
        _ => error!(archive_id = %archive_id, error = %e, "Archive failed"),
    }
}
