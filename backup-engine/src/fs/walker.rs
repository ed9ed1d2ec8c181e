//! Deterministic directory traversal for archive runs.
//!
//! Entries come out depth-first with siblings sorted by file name, so two
//! walks over an unchanged tree always yield the same sequence. Exclude
//! rules are globs matched against an entry's base name; a matching
//! directory is pruned together with everything beneath it.

use super::metadata::modified_at;
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links to directories
    pub follow_links: bool,

    /// Exclude rules (glob patterns on the base name)
    pub exclude_rules: Vec<String>,
}

/// A regular file discovered during the walk
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Root-relative path with `/` separators
    pub relative_path: String,

    /// File size in bytes at walk time
    pub size: u64,

    /// Last modification time
    pub modified_at: DateTime<Utc>,

    /// Reached through a symlink
    pub is_symlink: bool,

    /// Depth below the root
    pub depth: usize,
}

/// Compiled exclude rules. Rules that fail to compile are reported once and
/// never match.
#[derive(Debug, Clone, Default)]
pub struct ExcludeMatcher {
    matchers: Vec<GlobMatcher>,
    invalid: Vec<String>,
}

impl ExcludeMatcher {
    pub fn new(rules: &[String]) -> Self {
        let mut matchers = Vec::with_capacity(rules.len());
        let mut invalid = Vec::new();

        for rule in rules {
            match Glob::new(rule) {
                Ok(glob) => matchers.push(glob.compile_matcher()),
                Err(e) => {
                    warn!(rule = %rule, error = %e, "Ignoring invalid exclude rule");
                    invalid.push(rule.clone());
                }
            }
        }

        Self { matchers, invalid }
    }

    pub fn is_excluded(&self, file_name: &OsStr) -> bool {
        self.matchers.iter().any(|m| m.is_match(file_name))
    }

    /// Rules that were treated as non-matching because they did not parse
    pub fn invalid_rules(&self) -> &[String] {
        &self.invalid
    }
}

impl FileInfo {
    /// Build a FileInfo from a DirEntry.
    /// Symlinks are resolved so the target's size and mtime are recorded.
    /// Returns None for directories, dangling links and special files.
    fn from_entry(entry: &DirEntry, root: &Path) -> Result<Option<Self>> {
        let path = entry.path().to_path_buf();
        let file_type = entry.file_type();

        if file_type.is_dir() {
            return Ok(None);
        }

        let is_symlink = file_type.is_symlink();
        let metadata = if is_symlink {
            match std::fs::metadata(&path) {
                Ok(resolved) if resolved.is_file() => resolved,
                Ok(_) => {
                    debug!(path = %path.display(), "Skipping symlink to non-file");
                    return Ok(None);
                }
                Err(_) => {
                    debug!(path = %path.display(), "Skipping broken symlink");
                    return Ok(None);
                }
            }
        } else if file_type.is_file() {
            entry.metadata().map_err(|e| BackupError::read(&path, e.into()))?
        } else {
            debug!(path = %path.display(), "Skipping special file");
            return Ok(None);
        };

        let Some(relative_path) = relative_record_path(&path, root) else {
            warn!(path = %path.display(), "Skipping file with a non UTF-8 name");
            return Ok(None);
        };

        let modified_at = modified_at(&metadata).map_err(|e| BackupError::read(&path, e))?;

        Ok(Some(Self {
            path,
            relative_path,
            size: metadata.len(),
            modified_at,
            is_symlink,
            depth: entry.depth(),
        }))
    }
}

/// Walk a directory tree and collect every file to archive, in walk order.
///
/// # Example
/// ```no_run
/// use backup_engine::fs::walker::{walk_directory, WalkOptions};
/// use std::path::Path;
///
/// let files = walk_directory(Path::new("/data"), &WalkOptions::default()).unwrap();
/// println!("Found {} files", files.len());
/// ```
pub fn walk_directory(root: &Path, options: &WalkOptions) -> Result<Vec<FileInfo>> {
    walk_directory_until(root, options, || false)
}

/// Like [`walk_directory`], but fails with `Cancelled` as soon as
/// `should_stop` returns true. Checked before every entry.
pub fn walk_directory_until<S>(root: &Path, options: &WalkOptions, should_stop: S) -> Result<Vec<FileInfo>>
where
    S: Fn() -> bool,
{
    let mut files = Vec::new();
    walk_directory_with_callback(root, options, should_stop, |file| files.push(file))?;
    Ok(files)
}

/// Walk a directory tree with a callback for each file, in walk order.
pub fn walk_directory_with_callback<S, F>(root: &Path, options: &WalkOptions, should_stop: S, mut callback: F) -> Result<()>
where
    S: Fn() -> bool,
    F: FnMut(FileInfo),
{
    let matcher = ExcludeMatcher::new(&options.exclude_rules);

    let walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        // The root itself is never subject to exclusion
        .filter_entry(|entry| {
            if entry.depth() == 0 || !matcher.is_excluded(entry.file_name()) {
                return true;
            }
            debug!(path = %entry.path().display(), "Excluded by rule");
            false
        });

    for entry in walker {
        if should_stop() {
            return Err(BackupError::Cancelled);
        }
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            BackupError::read(path, e.into())
        })?;

        if let Some(file_info) = FileInfo::from_entry(&entry, root)? {
            callback(file_info);
        }
    }

    Ok(())
}

/// Convert a walked path into a `/`-separated record path.
fn relative_record_path(path: &Path, root: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(name) => segments.push(name.to_str()?),
            _ => return None,
        }
    }
    (!segments.is_empty()).then(|| segments.join("/"))
}
