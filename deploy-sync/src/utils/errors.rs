//! Error types for the deployment pipeline.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Validation(String),

    #[error("Invalid relative path: {0}")]
    InvalidPath(String),

    #[error("Invalid or expired upload ID: {0}")]
    UnknownUpload(String),

    #[error("Upload {upload_id} does not belong to {target}")]
    TargetMismatch { upload_id: String, target: String },

    #[error("Site '{0}' not found")]
    SiteNotFound(String),

    #[error("Physical path not found for site '{0}'")]
    MissingPhysicalPath(String),

    #[error("Backup failed: {0}")]
    Backup(String),

    #[error("Site control error: {0}")]
    SiteControl(String),

    #[error("Incomplete file {path}: {reason}")]
    IncompleteFile { path: String, reason: String },

    #[error("Merge failed: {0}")]
    Merge(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl SyncError {
    /// True for errors caused by the caller's input rather than server state.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SyncError::Validation(_)
                | SyncError::InvalidPath(_)
                | SyncError::UnknownUpload(_)
                | SyncError::TargetMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
