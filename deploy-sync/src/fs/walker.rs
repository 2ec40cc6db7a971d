//! Directory traversal for staging areas and live site trees.

use super::paths::relative_slash_path;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Directory names skipped wherever they appear (exact match)
    pub skip_dirs: Vec<String>,
}

impl WalkOptions {
    pub fn skipping<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            follow_links: false,
            skip_dirs: names.into_iter().map(Into::into).collect(),
        }
    }
}

/// A regular file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root, `/`-separated
    pub relative_path: String,

    /// File size in bytes
    pub size: u64,
}

/// Walk a directory tree and collect every regular file, sorted by relative path.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_skipped_dir(e, &options.skip_dirs));

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(relative_path) = relative_slash_path(root, entry.path()) else {
            continue;
        };
        files.push(FileInfo {
            path: entry.path().to_path_buf(),
            relative_path,
            size: entry.metadata()?.len(),
        });
    }

    Ok(files)
}

fn is_skipped_dir(entry: &DirEntry, skip_dirs: &[String]) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && skip_dirs
            .iter()
            .any(|name| entry.file_name().to_string_lossy() == name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert!(files.is_empty());
        Ok(())
    }

    #[test]
    fn test_walk_with_subdirectories() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("subdir"))?;
        fs::write(temp_dir.path().join("file1.txt"), b"content1")?;
        fs::write(temp_dir.path().join("subdir/file2.txt"), b"content22")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        let rels: Vec<_> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(rels, vec!["file1.txt", "subdir/file2.txt"]);
        assert_eq!(files[1].size, 9);

        Ok(())
    }

    #[test]
    fn test_skip_dirs() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir_all(temp_dir.path().join("__temp_uploads__/abc"))?;
        fs::write(temp_dir.path().join("__temp_uploads__/abc/x.txt"), b"staged")?;
        fs::write(temp_dir.path().join("index.html"), b"live")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::skipping(["__temp_uploads__"]))?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, "index.html");

        Ok(())
    }
}
