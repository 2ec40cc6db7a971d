//! Chunk fragment naming and reassembly.
//!
//! A fragment of `css/site.css` with index 3 is stored as
//! `css/site.css.part_3` inside the session's staging directory, next to where
//! the reassembled file will be written.

use crate::fs::walker::{walk_directory, WalkOptions};
use crate::utils::{Result, SyncError};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const PART_MARKER: &str = ".part_";
const ASSEMBLING_SUFFIX: &str = ".assembling";

/// Staging-relative path of fragment `index` of `relative_path`.
pub fn fragment_path(relative_path: &str, index: u32) -> String {
    format!("{relative_path}{PART_MARKER}{index}")
}

/// Split a fragment path into its target path and index.
pub fn parse_fragment(relative_path: &str) -> Option<(&str, u32)> {
    let (target, index) = relative_path.rsplit_once(PART_MARKER)?;
    if target.is_empty() || target.ends_with('/') || index.is_empty() {
        return None;
    }
    if !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((target, index.parse().ok()?))
}

/// Result of reassembling every fragmented file in a staging directory.
#[derive(Debug, Default)]
pub struct AssemblyReport {
    pub assembled: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Reassemble every fragmented file under `staging_dir`.
///
/// Fragments are concatenated in ascending index order. A file with a missing
/// index or a length that disagrees with `expected_sizes` is reported as failed
/// and left unassembled; other files are unaffected.
pub fn assemble_all(staging_dir: &Path, expected_sizes: &HashMap<String, u64>) -> io::Result<AssemblyReport> {
    let mut groups: BTreeMap<String, Vec<(u32, PathBuf)>> = BTreeMap::new();
    for file in walk_directory(staging_dir, &WalkOptions::default())? {
        if let Some((target, index)) = parse_fragment(&file.relative_path) {
            groups
                .entry(target.to_string())
                .or_default()
                .push((index, file.path));
        }
    }

    tracing::debug!(staging = %staging_dir.display(), files = groups.len(), "Reassembling chunked files");

    let mut report = AssemblyReport::default();
    for (target, mut fragments) in groups {
        fragments.sort_by_key(|(index, _)| *index);
        let output = staging_dir.join(&target);

        match assemble_file(&target, &fragments, &output, expected_sizes.get(&target).copied()) {
            Ok(bytes) => {
                for (_, fragment) in &fragments {
                    if let Err(e) = fs::remove_file(fragment) {
                        tracing::warn!(fragment = %fragment.display(), error = %e, "Failed to delete consumed chunk");
                    }
                }
                tracing::debug!(path = %target, chunks = fragments.len(), bytes, "File reassembled");
                report.assembled.push(target);
            }
            Err(e) => {
                tracing::warn!(path = %target, error = %e, "Skipping file that could not be reassembled");
                report.failed.push((target, e.to_string()));
            }
        }
    }

    Ok(report)
}

fn assemble_file(
    target: &str,
    fragments: &[(u32, PathBuf)],
    output: &Path,
    expected_size: Option<u64>,
) -> Result<u64> {
    for (position, (index, _)) in fragments.iter().enumerate() {
        if *index as usize != position {
            return Err(SyncError::IncompleteFile {
                path: target.to_string(),
                reason: format!("chunk {position} is missing"),
            });
        }
    }

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }

    // Written beside the output and renamed into place, so a failed attempt
    // never clobbers a file that is already assembled.
    let partial = partial_path(output);
    let result = concat_fragments(fragments, &partial).and_then(|written| match expected_size {
        Some(expected) if expected != written => Err(SyncError::IncompleteFile {
            path: target.to_string(),
            reason: format!("expected {expected} bytes, got {written}"),
        }),
        _ => Ok(written),
    });

    match result {
        Ok(written) => {
            fs::rename(&partial, output)?;
            Ok(written)
        }
        Err(e) => {
            let _ = fs::remove_file(&partial);
            Err(e)
        }
    }
}

fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(ASSEMBLING_SUFFIX);
    PathBuf::from(name)
}

fn concat_fragments(fragments: &[(u32, PathBuf)], partial: &Path) -> Result<u64> {
    let mut out = fs::File::create(partial)?;
    let mut written = 0u64;
    for (_, fragment) in fragments {
        let mut input = fs::File::open(fragment)?;
        written += io::copy(&mut input, &mut out)?;
    }
    out.flush()?;
    Ok(written)
}

/// Staged files ready to merge: every regular file that is not a fragment.
pub fn staged_files(staging_dir: &Path) -> io::Result<Vec<String>> {
    Ok(walk_directory(staging_dir, &WalkOptions::default())?
        .into_iter()
        .filter(|f| parse_fragment(&f.relative_path).is_none())
        .map(|f| f.relative_path)
        .collect())
}
