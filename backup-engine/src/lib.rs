//! Backup Engine Library
//!
//! Verifiable file-tree archives: create, restore, verify, list, delete and
//! retention cleanup over a pluggable storage backend.

pub mod archive;
pub mod clock;
pub mod config;
pub mod executor;
pub mod fs;
pub mod storage;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use archive::{ArchiveKind, ArchiveMetadata, BackupOptions, FileRecord};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineSettings;
pub use executor::{BackupService, CleanupReport, RestoreSummary, VerifySummary};
pub use storage::{ArchiveStore, LocalStorage};
pub use utils::errors::{BackupError, ErrorKind};
pub type Result<T> = std::result::Result<T, BackupError>;
