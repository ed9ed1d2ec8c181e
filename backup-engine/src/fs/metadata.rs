//! File timestamp handling for backup and restore.
//!
//! Archives record modification times as UTC instants; restore writes them
//! back so a restored tree matches its source.

use chrono::{DateTime, Utc};
use filetime::FileTime;
use std::fs;
use std::io;
use std::path::Path;

/// Modification time of a file as a UTC instant
pub fn modified_at(metadata: &fs::Metadata) -> io::Result<DateTime<Utc>> {
    Ok(DateTime::<Utc>::from(metadata.modified()?))
}

/// Apply a recorded modification time to a file, leaving its access time
/// untouched.
pub fn set_modified_at(path: &Path, instant: DateTime<Utc>) -> io::Result<()> {
    let mtime = FileTime::from_unix_time(instant.timestamp(), instant.timestamp_subsec_nanos());
    filetime::set_file_mtime(path, mtime)
}
