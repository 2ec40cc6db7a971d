//! Hosted-site control.
//!
//! The deploy pipeline only needs to stop, start and locate sites; everything
//! about how a site is actually served sits behind [`SiteManager`].

pub mod registry;

use crate::utils::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use registry::RegistrySiteManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectState {
    Starting,
    Started,
    Stopping,
    Stopped,
    Unknown,
}

impl ObjectState {
    pub fn is_running(self) -> bool {
        matches!(self, ObjectState::Started | ObjectState::Starting)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Binding {
    pub protocol: String,
    pub binding_information: String,
}

impl Binding {
    /// Host part of `ip:port:host` binding information.
    pub fn host(&self) -> &str {
        self.binding_information.rsplit(':').next().unwrap_or_default()
    }
}

/// Public view of a hosted site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteInfo {
    pub name: String,
    pub id: i64,
    pub physical_path: PathBuf,
    pub application_pool: String,
    pub state: ObjectState,
    pub bindings: Vec<Binding>,
}

/// Lifecycle and configuration control for hosted sites.
///
/// Implementations may block; callers run them on the blocking pool.
pub trait SiteManager: Send + Sync {
    fn list(&self) -> Result<Vec<SiteInfo>>;

    fn get(&self, name: &str) -> Result<Option<SiteInfo>>;

    fn physical_path(&self, name: &str) -> Result<Option<PathBuf>> {
        Ok(self
            .get(name)?
            .map(|s| s.physical_path)
            .filter(|p| !p.as_os_str().is_empty()))
    }

    fn site_state(&self, name: &str) -> Result<ObjectState>;

    fn pool_state(&self, pool: &str) -> Result<ObjectState>;

    fn start_site(&self, name: &str) -> Result<()>;

    fn stop_site(&self, name: &str) -> Result<()>;

    fn start_pool(&self, pool: &str) -> Result<()>;

    fn stop_pool(&self, pool: &str) -> Result<()>;

    fn add_binding(&self, name: &str, binding: Binding) -> Result<()>;

    /// Returns false when no binding matched.
    fn remove_binding(&self, name: &str, binding_information: &str) -> Result<bool>;

    fn set_physical_path(&self, name: &str, path: PathBuf) -> Result<()>;

    fn set_application_pool(&self, name: &str, pool: &str) -> Result<()>;

    /// Persist configuration changes.
    fn commit(&self) -> Result<()>;
}
