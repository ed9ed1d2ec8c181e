//! Backup options and their validation.
//!
//! Every check here runs before a run has any side effect on storage. The
//! only filesystem change validation may make is creating a missing
//! destination directory.

use super::metadata::ArchiveKind;
use crate::utils::errors::{BackupError, Result};
use globset::Glob;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Upper bound on retention (about a century).
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// What to capture and how long to keep it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupOptions {
    pub kind: ArchiveKind,
    pub source_root: PathBuf,
    pub destination: PathBuf,
    #[serde(default)]
    pub exclude_rules: Vec<String>,
    /// Days to keep the archive; `None` falls back to the engine default,
    /// `Some(0)` keeps it forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<u32>,
}

impl BackupOptions {
    pub fn new(kind: ArchiveKind, source_root: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            source_root: source_root.into(),
            destination: destination.into(),
            exclude_rules: Vec::new(),
            retention_days: None,
        }
    }

    pub fn with_exclude_rules<I, S>(mut self, rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_rules = rules.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = Some(days);
        self
    }
}

/// Options that passed validation, with the source root made absolute.
#[derive(Debug, Clone)]
pub struct ValidatedOptions {
    pub kind: ArchiveKind,
    pub source_root: PathBuf,
    pub destination: PathBuf,
    pub exclude_rules: Vec<String>,
    pub retention_days: Option<u32>,
}

/// Check options against the rules in one pass. Blocking; async callers run
/// it on the blocking pool.
pub fn validate(options: &BackupOptions) -> Result<ValidatedOptions> {
    let source_root = validate_source(&options.source_root)?;
    validate_destination(&options.destination)?;

    if let Some(days) = options.retention_days {
        if days > MAX_RETENTION_DAYS {
            return Err(BackupError::InvalidOption(format!(
                "retention of {} days exceeds the maximum of {}",
                days, MAX_RETENTION_DAYS
            )));
        }
    }

    for rule in &options.exclude_rules {
        validate_exclude_rule(rule)?;
    }

    Ok(ValidatedOptions {
        kind: options.kind,
        source_root,
        destination: options.destination.clone(),
        exclude_rules: options.exclude_rules.clone(),
        retention_days: options.retention_days,
    })
}

/// An exclude rule must be a non-empty, syntactically valid glob.
pub fn validate_exclude_rule(rule: &str) -> Result<()> {
    if rule.trim().is_empty() {
        return Err(BackupError::InvalidOption("exclude rule must not be empty".into()));
    }
    Glob::new(rule)
        .map(|_| ())
        .map_err(|e| BackupError::InvalidOption(format!("invalid exclude rule '{}': {}", rule, e)))
}

fn validate_source(source: &Path) -> Result<PathBuf> {
    if source.as_os_str().is_empty() {
        return Err(BackupError::InvalidOption("source root is required".into()));
    }

    let metadata = fs::metadata(source).map_err(|e| {
        BackupError::InvalidOption(format!("source root {} is not accessible: {}", source.display(), e))
    })?;
    if !metadata.is_dir() {
        return Err(BackupError::InvalidOption(format!(
            "source root {} is not a directory",
            source.display()
        )));
    }

    fs::read_dir(source).map_err(|e| {
        BackupError::InvalidOption(format!("source root {} is not readable: {}", source.display(), e))
    })?;

    fs::canonicalize(source).map_err(|e| {
        BackupError::InvalidOption(format!("source root {} cannot be resolved: {}", source.display(), e))
    })
}

fn validate_destination(destination: &Path) -> Result<()> {
    if destination.as_os_str().is_empty() {
        return Err(BackupError::InvalidOption("destination is required".into()));
    }

    match fs::metadata(destination) {
        Ok(metadata) if !metadata.is_dir() => {
            return Err(BackupError::InvalidOption(format!(
                "destination {} is not a directory",
                destination.display()
            )));
        }
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            fs::create_dir_all(destination).map_err(|e| {
                BackupError::InvalidOption(format!(
                    "destination {} cannot be created: {}",
                    destination.display(),
                    e
                ))
            })?;
        }
        Err(e) => {
            return Err(BackupError::InvalidOption(format!(
                "destination {} is not accessible: {}",
                destination.display(),
                e
            )));
        }
    }

    // Probe writability with a throwaway file
    let probe = destination.join(format!(".write-probe-{}", uuid::Uuid::new_v4().simple()));
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&probe)
        .map_err(|e| {
            BackupError::InvalidOption(format!("destination {} is not writable: {}", destination.display(), e))
        })?;
    if let Err(e) = fs::remove_file(&probe) {
        tracing::warn!(path = %probe.display(), error = %e, "Failed to remove write probe");
    }

    Ok(())
}
