//! Storage contract for archives.
//!
//! The engine only ever talks to an [`ArchiveStore`]: it reserves an archive
//! with [`ArchiveStore::create_writer`], streams files through the returned
//! [`ArchiveWriter`], and reads them back through an [`ArchiveReader`].
//!
//! Backends must honour the atomic-publish rule: an archive becomes visible
//! to [`ArchiveStore::list`] and [`ArchiveStore::open_reader`] only once
//! [`ArchiveWriter::close`] completes after [`ArchiveWriter::commit_metadata`].
//! Anything less, including [`ArchiveWriter::abort`], stays invisible until
//! an orphan sweep removes it.

pub mod local;

use crate::archive::{ArchiveMetadata, FileRecord};
use crate::utils::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;

pub use local::LocalStorage;

/// Readable archive content.
pub type ContentStream = Box<dyn AsyncRead + Send + Unpin>;

/// Catalog of archives on a backend.
///
/// Implementations must tolerate concurrent `create_writer` calls for
/// different ids and concurrent reads of distinct archives.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Reserve `draft.id`. Fails if the id is already taken.
    async fn create_writer(&self, draft: &ArchiveMetadata) -> Result<Box<dyn ArchiveWriter>>;

    /// Open a published archive; `NotFound` otherwise.
    async fn open_reader(&self, id: &str) -> Result<Box<dyn ArchiveReader>>;

    /// Remove an archive and its metadata. Unknown ids succeed silently.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Published archives ordered by `created_at`, then `id`.
    async fn list(&self) -> Result<Vec<ArchiveMetadata>>;

    /// Remove unpublished leftovers last touched before `cutoff`, returning
    /// the ids removed. Backends without such leftovers keep the default.
    async fn sweep_orphans(&self, _cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Output side of one archive.
#[async_trait]
pub trait ArchiveWriter: Send {
    fn archive_id(&self) -> &str;

    /// Stream one file into the archive without buffering it whole.
    /// Returns the number of bytes stored.
    async fn add_file(&mut self, record: &FileRecord, content: &mut (dyn AsyncRead + Send + Unpin)) -> Result<u64>;

    /// Stage the final metadata document.
    async fn commit_metadata(&mut self, metadata: &ArchiveMetadata) -> Result<()>;

    /// Publish if metadata was committed, otherwise publish nothing.
    /// Releases backend resources on every path.
    async fn close(self: Box<Self>) -> Result<()>;

    /// Release backend resources without publishing, even when metadata was
    /// already committed. The archive stays unpublished.
    async fn abort(self: Box<Self>);
}

/// Input side of one published archive.
#[async_trait]
pub trait ArchiveReader: Send + Sync {
    fn metadata(&self) -> &ArchiveMetadata;

    /// Open one file's content; `NotFound` if the path is not in the metadata.
    async fn open_file(&self, path: &str) -> Result<(ContentStream, FileRecord)>;

    /// Records in the order they were written.
    fn list_files(&self) -> Vec<FileRecord> {
        self.metadata().files.clone()
    }
}
