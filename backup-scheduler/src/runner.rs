//! Seam between the scheduler and the engine that performs a run.

use async_trait::async_trait;
use backup_engine::{ArchiveMetadata, BackupOptions, BackupService, Result};
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait BackupRunner: Send + Sync {
    /// Check options before a schedule is registered.
    async fn validate(&self, options: &BackupOptions) -> Result<()>;

    /// Create one archive, honouring `cancel`.
    async fn run(&self, options: &BackupOptions, cancel: CancellationToken) -> Result<ArchiveMetadata>;
}

#[async_trait]
impl BackupRunner for BackupService {
    async fn validate(&self, options: &BackupOptions) -> Result<()> {
        self.validate_options(options).await.map(|_| ())
    }

    async fn run(&self, options: &BackupOptions, cancel: CancellationToken) -> Result<ArchiveMetadata> {
        self.create_with_cancel(options, cancel).await
    }
}
