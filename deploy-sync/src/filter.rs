//! Exclusion patterns for synchronization.
//!
//! Patterns are plain strings from the persisted settings, matched with
//! prefix/suffix/substring checks only:
//!
//! | Pattern          | Matches when the path...                 |
//! |------------------|------------------------------------------|
//! | `exact/path.txt` | equals the pattern                       |
//! | `logs/*`         | starts with `logs/`                      |
//! | `*.log`          | ends with `.log`                         |
//! | `*.min.*`        | contains `.min.`                         |
//!
//! Matching is case-sensitive.

use serde::{Deserialize, Serialize};

/// Ordered snapshot of the configured exclusion patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IgnorePatterns(Vec<String>);

impl IgnorePatterns {
    pub fn new(patterns: Vec<String>) -> Self {
        Self(patterns)
    }

    pub fn is_ignored(&self, relative_path: &str) -> bool {
        should_ignore(relative_path, &self.0)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<String>> for IgnorePatterns {
    fn from(patterns: Vec<String>) -> Self {
        Self(patterns)
    }
}

/// Whether `relative_path` is excluded by any of `patterns`.
pub fn should_ignore(relative_path: &str, patterns: &[String]) -> bool {
    if patterns.is_empty() {
        return false;
    }
    let path = relative_path.replace('\\', "/");
    patterns.iter().any(|pattern| pattern_matches(&path, pattern))
}

fn pattern_matches(path: &str, pattern: &str) -> bool {
    if path == pattern {
        return true;
    }

    if pattern.ends_with("/*") {
        if let Some(prefix) = pattern.strip_suffix('*') {
            if path.starts_with(prefix) {
                return true;
            }
        }
    }

    if let Some(suffix) = pattern.strip_prefix('*') {
        if path.ends_with(suffix) {
            return true;
        }
    }

    if pattern.len() > 2 && pattern.starts_with('*') && pattern.ends_with('*') {
        let inner = &pattern[1..pattern.len() - 1];
        if path.contains(inner) {
            return true;
        }
    }

    false
}
