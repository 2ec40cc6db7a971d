//! Utility modules for the deployment pipeline.

pub mod errors;
pub mod logger;

pub use errors::{Result, SyncError};
