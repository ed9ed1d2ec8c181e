//! Error taxonomy for backup, restore, verification and scheduling.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Invalid option: {0}")]
    InvalidOption(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("Read error at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Write error at {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Integrity error in {path}: {detail}")]
    Integrity { path: String, detail: String },

    #[error("Restore error at {path}: {detail}")]
    Restore { path: String, detail: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Closed set of error kinds exposed on the control surface and persisted
/// with schedule outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    InvalidOption,
    NotFound,
    DuplicateId,
    InvalidCron,
    ReadError,
    WriteError,
    IntegrityError,
    RestoreError,
    Cancelled,
    BackendError,
}

impl BackupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::InvalidOption(_) => ErrorKind::InvalidOption,
            BackupError::NotFound(_) => ErrorKind::NotFound,
            BackupError::DuplicateId(_) => ErrorKind::DuplicateId,
            BackupError::InvalidCron(_) => ErrorKind::InvalidCron,
            BackupError::Read { .. } => ErrorKind::ReadError,
            BackupError::Write { .. } => ErrorKind::WriteError,
            BackupError::Integrity { .. } => ErrorKind::IntegrityError,
            BackupError::Restore { .. } => ErrorKind::RestoreError,
            BackupError::Cancelled => ErrorKind::Cancelled,
            BackupError::Backend(_) => ErrorKind::BackendError,
        }
    }

    pub(crate) fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackupError::Read {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackupError::Write {
            path: path.into(),
            source,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidOption => "InvalidOption",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::DuplicateId => "DuplicateId",
            ErrorKind::InvalidCron => "InvalidCron",
            ErrorKind::ReadError => "ReadError",
            ErrorKind::WriteError => "WriteError",
            ErrorKind::IntegrityError => "IntegrityError",
            ErrorKind::RestoreError => "RestoreError",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::BackendError => "BackendError",
        };
        f.write_str(name)
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
