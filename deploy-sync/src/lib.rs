//! Deploy Sync Library
//!
//! Publishes site content into live directories: manifest diffing, chunked
//! staging, backup archives and the stop/backup/merge/start sequence.

pub mod archive;
pub mod deploy;
pub mod diff;
pub mod filter;
pub mod fs;
pub mod sites;
pub mod staging;
pub mod utils;

// Re-export commonly used types
pub use deploy::{Deployer, TransferMode};
pub use filter::IgnorePatterns;
pub use utils::errors::SyncError;
pub type Result<T> = std::result::Result<T, SyncError>;
