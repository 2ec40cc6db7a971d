//! Backup archives taken before a deploy touches a live directory.
//!
//! One archive per target per deploy: `<targetId>_<YYYYMMDD_HHMMSS>.tar.zst`,
//! written to a `backups` directory next to the physical path. Archives are
//! never pruned.

use crate::fs::walker::{walk_directory, WalkOptions};
use crate::staging::{GROUP_STAGING_DIR, STAGING_DIR};
use crate::utils::{Result, SyncError};
use chrono::{DateTime, Local};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const ARCHIVE_EXTENSION: &str = "tar.zst";

/// Snapshot a physical directory. Called from blocking context.
pub trait Archiver: Send + Sync {
    fn create_backup(&self, target_id: &str, physical_path: &Path) -> Result<PathBuf>;
}

/// Writes zstd-compressed tar archives.
#[derive(Debug, Clone)]
pub struct TarZstdArchiver {
    compression_level: i32,
    directory_name: String,
}

impl Default for TarZstdArchiver {
    fn default() -> Self {
        Self::new(3, "backups")
    }
}

impl TarZstdArchiver {
    pub fn new(compression_level: i32, directory_name: impl Into<String>) -> Self {
        Self {
            compression_level,
            directory_name: directory_name.into(),
        }
    }

    /// Directory the archives of `physical_path` go to.
    pub fn backup_dir_for(&self, physical_path: &Path) -> PathBuf {
        match physical_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(&self.directory_name),
            _ => physical_path.join("..").join(&self.directory_name),
        }
    }

    fn write_archive(&self, physical_path: &Path, archive_path: &Path) -> Result<u64> {
        let file = fs::File::create(archive_path)?;
        let encoder = zstd::Encoder::new(file, self.compression_level)?;
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        let options = WalkOptions::skipping([STAGING_DIR, GROUP_STAGING_DIR]);
        let files = walk_directory(physical_path, &options)?;
        for file in &files {
            builder.append_path_with_name(&file.path, &file.relative_path)?;
        }

        let encoder = builder.into_inner()?;
        let mut file = encoder.finish()?;
        file.flush()?;
        file.sync_all()?;
        Ok(files.len() as u64)
    }
}

impl Archiver for TarZstdArchiver {
    fn create_backup(&self, target_id: &str, physical_path: &Path) -> Result<PathBuf> {
        if !physical_path.is_dir() {
            return Err(SyncError::Backup(format!(
                "{} is not a directory",
                physical_path.display()
            )));
        }

        let backup_dir = self.backup_dir_for(physical_path);
        fs::create_dir_all(&backup_dir)
            .map_err(|e| SyncError::Backup(format!("cannot create {}: {e}", backup_dir.display())))?;

        let archive_path = backup_dir.join(archive_name(target_id, Local::now()));
        match self.write_archive(physical_path, &archive_path) {
            Ok(files) => {
                tracing::info!(target_id, archive = %archive_path.display(), files, "Backup created");
                Ok(archive_path)
            }
            Err(e) => {
                let _ = fs::remove_file(&archive_path);
                Err(SyncError::Backup(e.to_string()))
            }
        }
    }
}

/// `<targetId>_<YYYYMMDD_HHMMSS>.tar.zst`, with path separators in the id replaced.
pub fn archive_name(target_id: &str, at: DateTime<Local>) -> String {
    let safe: String = target_id
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect();
    format!("{}_{}.{}", safe, at.format("%Y%m%d_%H%M%S"), ARCHIVE_EXTENSION)
}

/// Read back the entry names of an archive.
pub fn list_archive(archive_path: &Path) -> Result<Vec<String>> {
    let decoder = zstd::Decoder::new(fs::File::open(archive_path)?)?;
    let mut archive = tar::Archive::new(decoder);
    let mut names = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        names.push(entry.path()?.to_string_lossy().replace('\\', "/"));
    }
    Ok(names)
}

/// Read one file out of an archive.
pub fn read_archived_file(archive_path: &Path, relative_path: &str) -> Result<Option<Vec<u8>>> {
    let decoder = zstd::Decoder::new(fs::File::open(archive_path)?)?;
    let mut archive = tar::Archive::new(decoder);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_string_lossy().replace('\\', "/") == relative_path {
            let mut data = Vec::new();
            std::io::Read::read_to_end(&mut entry, &mut data)?;
            return Ok(Some(data));
        }
    }
    Ok(None)
}
