//! Relative path validation.
//!
//! Every path that arrives from a client (manifest entries, chunk and file
//! names) passes through [`sanitize_relative`] before it is joined onto a
//! server directory.

use crate::staging::{GROUP_STAGING_DIR, STAGING_DIR};
use crate::utils::{Result, SyncError};
use std::path::Path;

/// Normalize a client relative path to `/`-separated form.
///
/// Rejects empty paths, absolute paths, drive prefixes, `..` components and
/// paths that point into a staging area.
pub fn sanitize_relative(raw: &str) -> Result<String> {
    let unified = raw.replace('\\', "/");
    if unified.starts_with('/') {
        return Err(SyncError::InvalidPath(raw.to_string()));
    }

    let mut parts = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(SyncError::InvalidPath(raw.to_string())),
            p if p.contains(':') => return Err(SyncError::InvalidPath(raw.to_string())),
            p => parts.push(p),
        }
    }

    match parts.first() {
        None => Err(SyncError::InvalidPath(raw.to_string())),
        Some(&first) if first == STAGING_DIR || first == GROUP_STAGING_DIR => {
            Err(SyncError::InvalidPath(raw.to_string()))
        }
        Some(_) => Ok(parts.join("/")),
    }
}

/// Render `path` relative to `root` with `/` separators.
pub fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_sanitize_normalizes_separators() {
        assert_eq!(sanitize_relative("css\\site.css").unwrap(), "css/site.css");
        assert_eq!(sanitize_relative("./a//b/c.txt").unwrap(), "a/b/c.txt");
    }

    #[test]
    fn test_sanitize_rejects_escapes() {
        assert!(sanitize_relative("").is_err());
        assert!(sanitize_relative("/etc/passwd").is_err());
        assert!(sanitize_relative("a/../../b").is_err());
        assert!(sanitize_relative("C:/Windows/win.ini").is_err());
        assert!(sanitize_relative("__temp_uploads__/x/y").is_err());
    }

    #[test]
    fn test_relative_slash_path() {
        let root = PathBuf::from("/srv/site");
        let file = root.join("bin").join("app.dll");
        assert_eq!(relative_slash_path(&root, &file).as_deref(), Some("bin/app.dll"));
        assert_eq!(relative_slash_path(&root, &root), None);
    }
}
