//! Manifest diffing against a live site directory.
//!
//! The browser scans its local folder and submits one [`ClientFileEntry`] per
//! item. Each entry is classified, in manifest order, as needing an update or
//! not, and only the former are uploaded afterwards.

use crate::filter::IgnorePatterns;
use crate::fs::metadata::{deserialize_client_timestamp, same_instant, FileStamp};
use crate::fs::paths::sanitize_relative;
use crate::utils::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const REASON_EXCLUDED: &str = "matches exclusion pattern";
pub const REASON_DIRECTORY: &str = "is a directory";
pub const REASON_UP_TO_DATE: &str = "already up to date";

/// One row of the client's manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFileEntry {
    pub relative_path: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(deserialize_with = "deserialize_client_timestamp")]
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub is_directory: bool,
}

/// The live counterpart of a manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFileEntry {
    pub relative_path: String,
    pub file_name: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub is_directory: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateReason {
    NotOnServer,
    ModifiedTimeDiffers,
    SizeDiffers,
    Ignored,
}

/// Diff outcome for one manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileVerdict {
    pub relative_path: String,
    pub client_file: ClientFileEntry,
    pub server_file: Option<ServerFileEntry>,
    pub reason: UpdateReason,
    pub ignored: bool,
    pub ignore_reason: String,
}

impl FileVerdict {
    fn update(entry: &ClientFileEntry, server_file: Option<ServerFileEntry>, reason: UpdateReason) -> Self {
        Self {
            relative_path: entry.relative_path.clone(),
            client_file: entry.clone(),
            server_file,
            reason,
            ignored: false,
            ignore_reason: String::new(),
        }
    }

    fn ignored(entry: &ClientFileEntry, server_file: Option<ServerFileEntry>, why: &str) -> Self {
        Self {
            relative_path: entry.relative_path.clone(),
            client_file: entry.clone(),
            server_file,
            reason: UpdateReason::Ignored,
            ignored: true,
            ignore_reason: why.to_string(),
        }
    }
}

/// Aggregate result of one diff request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffReport {
    pub files: Vec<FileVerdict>,
    pub files_to_update: Vec<String>,
    pub ignored_files: Vec<FileVerdict>,
}

impl DiffReport {
    fn push(&mut self, verdict: FileVerdict) {
        if verdict.reason == UpdateReason::Ignored {
            self.ignored_files.push(verdict.clone());
        } else {
            self.files_to_update.push(verdict.relative_path.clone());
        }
        self.files.push(verdict);
    }
}

/// Compare `manifest` against the tree under `service_root`.
///
/// Any failure (missing root, invalid path, unexpected I/O error) fails the
/// whole request; no partial report is produced.
pub fn diff(
    service_root: &Path,
    manifest: &[ClientFileEntry],
    patterns: &IgnorePatterns,
) -> Result<DiffReport> {
    if !service_root.is_dir() {
        return Err(SyncError::Validation(format!(
            "Service root {} does not exist",
            service_root.display()
        )));
    }
    if manifest.is_empty() {
        return Err(SyncError::Validation("Manifest is empty".into()));
    }

    let mut report = DiffReport::default();

    for entry in manifest {
        if patterns.is_ignored(&entry.relative_path) {
            report.push(FileVerdict::ignored(entry, None, REASON_EXCLUDED));
            continue;
        }

        if entry.is_directory {
            report.push(FileVerdict::ignored(entry, None, REASON_DIRECTORY));
            continue;
        }

        let relative = sanitize_relative(&entry.relative_path)?;
        let server_path = service_root.join(&relative);

        let stamp = match FileStamp::from_path(&server_path) {
            Ok(stamp) if server_path.is_file() => stamp,
            Ok(_) => {
                report.push(FileVerdict::update(entry, None, UpdateReason::NotOnServer));
                continue;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                report.push(FileVerdict::update(entry, None, UpdateReason::NotOnServer));
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let server_file = ServerFileEntry {
            relative_path: entry.relative_path.clone(),
            file_name: server_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size: stamp.size,
            last_modified: stamp.modified,
            is_directory: false,
        };

        let verdict = if !same_instant(&stamp.modified, &entry.last_modified) {
            FileVerdict::update(entry, Some(server_file), UpdateReason::ModifiedTimeDiffers)
        } else if stamp.size != entry.size {
            FileVerdict::update(entry, Some(server_file), UpdateReason::SizeDiffers)
        } else {
            FileVerdict::ignored(entry, Some(server_file), REASON_UP_TO_DATE)
        };
        report.push(verdict);
    }

    tracing::debug!(
        root = %service_root.display(),
        total = report.files.len(),
        to_update = report.files_to_update.len(),
        ignored = report.ignored_files.len(),
        "Manifest diff complete"
    );

    Ok(report)
}
