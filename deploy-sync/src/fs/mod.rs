//! Filesystem helpers shared by the diff, staging and deploy stages.

pub mod metadata;
pub mod paths;
pub mod walker;
