//! Archive descriptor types.
//!
//! An [`ArchiveMetadata`] is drafted when a run starts, accumulates one
//! [`FileRecord`] per archived file during the walk, and is committed to
//! storage exactly once as `metadata.json`. It is never mutated afterwards.

use crate::utils::errors::BackupError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Kind of capture. Both kinds walk the full tree; `Incremental` only
/// differs in that it may carry a parent reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveKind {
    Full,
    Incremental,
}

impl FromStr for ArchiveKind {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(ArchiveKind::Full),
            "incremental" => Ok(ArchiveKind::Incremental),
            other => Err(BackupError::InvalidOption(format!(
                "unknown archive kind '{}' (expected full or incremental)",
                other
            ))),
        }
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveKind::Full => f.write_str("full"),
            ArchiveKind::Incremental => f.write_str("incremental"),
        }
    }
}

/// One archived file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Source-root-relative path with `/` separators
    pub path: String,

    /// Byte count of the archived content
    pub size: u64,

    /// Last modification instant of the source file
    pub modified_at: DateTime<Utc>,

    #[serde(default)]
    pub is_directory: bool,

    /// Lowercase hex SHA-256 of the content (absent for directories)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl FileRecord {
    /// A regular-file record whose hash is filled in once its content has
    /// been streamed.
    pub fn file(path: impl Into<String>, size: u64, modified_at: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            size,
            modified_at,
            is_directory: false,
            hash: None,
        }
    }

    pub fn directory(path: impl Into<String>, modified_at: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            size: 0,
            modified_at,
            is_directory: true,
            hash: None,
        }
    }
}

/// Descriptor of one committed archive, serialized as `metadata.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveMetadata {
    pub id: String,
    pub kind: ArchiveKind,
    pub source_root: PathBuf,
    pub destination: String,
    pub created_at: DateTime<Utc>,
    pub files: Vec<FileRecord>,
    pub total_size: u64,
    pub file_count: u64,
    #[serde(default)]
    pub exclude_rules: Vec<String>,
    #[serde(default)]
    pub retention_days: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl ArchiveMetadata {
    /// Start a draft with no files.
    pub fn draft(
        id: String,
        kind: ArchiveKind,
        source_root: PathBuf,
        destination: String,
        created_at: DateTime<Utc>,
        exclude_rules: Vec<String>,
        retention_days: u32,
    ) -> Self {
        Self {
            id,
            kind,
            source_root,
            destination,
            created_at,
            files: Vec::new(),
            total_size: 0,
            file_count: 0,
            exclude_rules,
            retention_days,
            parent_id: None,
        }
    }

    /// Append a record in walk order, keeping the aggregates in step.
    pub fn push_file(&mut self, record: FileRecord) {
        if !record.is_directory {
            self.total_size += record.size;
            self.file_count += 1;
        }
        self.files.push(record);
    }

    pub fn find_file(&self, path: &str) -> Option<&FileRecord> {
        self.files.iter().find(|record| record.path == path)
    }

    /// Whether retention makes this archive eligible for deletion at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.retention_days == 0 {
            return false;
        }
        match now.checked_sub_signed(Duration::days(i64::from(self.retention_days))) {
            Some(cutoff) => self.created_at <= cutoff,
            None => false,
        }
    }
}

/// Allocate an archive id. The timestamp prefix keeps ids ordered by wall
/// clock; the random suffix keeps concurrent runs apart.
pub fn generate_archive_id(created_at: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", created_at.format("%Y%m%dT%H%M%S%.6fZ"), &suffix[..8])
}

/// Whether `path` is a usable record path: relative, `/`-separated, with no
/// empty, `.` or `..` segments.
pub fn is_safe_relative_path(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && !path.contains('\0')
        && path
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}

/// Join a record path onto a native base directory.
pub fn native_path(base: &Path, record_path: &str) -> PathBuf {
    record_path
        .split('/')
        .fold(base.to_path_buf(), |acc, segment| acc.join(segment))
}
