//! Archive metadata model and backup options.

pub mod metadata;
pub mod options;

pub use metadata::{ArchiveKind, ArchiveMetadata, FileRecord};
pub use options::{BackupOptions, ValidatedOptions};
