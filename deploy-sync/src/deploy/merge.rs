//! Moving staged files into a live directory.
//!
//! All functions here block and run on the blocking pool.

use super::TransferMode;
use crate::filter::IgnorePatterns;
use crate::fs::metadata::set_modified;
use crate::utils::{Result, SyncError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub merged: Vec<String>,
    /// Excluded by the ignore patterns.
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Transfer `files` (relative to `staging_dir`) into `dest`.
///
/// Only a missing destination root is fatal. A file that cannot be
/// transferred is logged and recorded in [`MergeReport::failed`].
pub fn merge_staged(
    staging_dir: &Path,
    files: &[String],
    dest: &Path,
    mode: TransferMode,
    patterns: &IgnorePatterns,
) -> Result<MergeReport> {
    if !dest.is_dir() {
        return Err(SyncError::Merge(format!(
            "destination {} is not a directory",
            dest.display()
        )));
    }

    let mut report = MergeReport::default();
    for relative in files {
        if patterns.is_ignored(relative) {
            tracing::debug!(path = %relative, "Skipping excluded file");
            report.skipped.push(relative.clone());
            continue;
        }

        match transfer(&staging_dir.join(relative), &dest.join(relative), mode) {
            Ok(()) => report.merged.push(relative.clone()),
            Err(e) => {
                tracing::warn!(path = %relative, error = %e, "Failed to merge file");
                report.failed.push((relative.clone(), e.to_string()));
            }
        }
    }

    Ok(report)
}

fn transfer(src: &Path, dst: &Path, mode: TransferMode) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::symlink_metadata(dst) {
        Ok(meta) if meta.is_dir() => {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "a directory exists at the destination",
            ))
        }
        Ok(_) => fs::remove_file(dst)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    match mode {
        TransferMode::Copy => {
            fs::copy(src, dst)?;
        }
        TransferMode::Move => {
            if fs::rename(src, dst).is_err() {
                // Staging may sit on another filesystem.
                fs::copy(src, dst)?;
                fs::remove_file(src)?;
            }
        }
    }
    Ok(())
}

/// Apply recorded client modification times to merged files.
/// Returns the files whose time could not be set.
pub fn restore_dates(
    dest: &Path,
    merged: &[String],
    last_modified: &HashMap<String, DateTime<Utc>>,
) -> Vec<(String, String)> {
    let mut failed = Vec::new();
    for relative in merged {
        let Some(when) = last_modified.get(relative) else {
            continue;
        };
        if let Err(e) = set_modified(&dest.join(relative), when) {
            tracing::warn!(path = %relative, error = %e, "Failed to restore modification time");
            failed.push((relative.clone(), e.to_string()));
        }
    }
    failed
}
