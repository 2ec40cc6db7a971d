//! File-backed site registry.
//!
//! Sites are declared in a JSON file:
//!
//! ```json
//! [{ "name": "shop", "id": 1, "physicalPath": "/srv/shop/wwwroot",
//!    "applicationPool": "shop", "state": "Started",
//!    "bindings": [{ "protocol": "http", "bindingInformation": "*:80:shop.local" }],
//!    "startCommand": "systemctl start shop", "stopCommand": "systemctl stop shop" }]
//! ```
//!
//! Run state is tracked in memory. Start/stop commands, when present, run
//! through the platform shell and must exit successfully.

use super::{Binding, ObjectState, SiteInfo, SiteManager};
use crate::utils::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteRecord {
    pub name: String,
    #[serde(default)]
    pub id: i64,
    pub physical_path: PathBuf,
    #[serde(default)]
    pub application_pool: String,
    #[serde(default = "default_state")]
    pub state: ObjectState,
    #[serde(default)]
    pub bindings: Vec<Binding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_command: Option<String>,
}

fn default_state() -> ObjectState {
    ObjectState::Started
}

impl SiteRecord {
    fn info(&self) -> SiteInfo {
        SiteInfo {
            name: self.name.clone(),
            id: self.id,
            physical_path: self.physical_path.clone(),
            application_pool: self.application_pool.clone(),
            state: self.state,
            bindings: self.bindings.clone(),
        }
    }
}

struct Registry {
    sites: Vec<SiteRecord>,
    pools: HashMap<String, ObjectState>,
}

impl Registry {
    fn new(sites: Vec<SiteRecord>) -> Self {
        let mut pools = HashMap::new();
        for site in &sites {
            if site.application_pool.is_empty() {
                continue;
            }
            let entry = pools
                .entry(site.application_pool.clone())
                .or_insert(ObjectState::Stopped);
            if site.state.is_running() {
                *entry = ObjectState::Started;
            }
        }
        Self { sites, pools }
    }

    fn site_mut(&mut self, name: &str) -> Result<&mut SiteRecord> {
        self.sites
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| SyncError::SiteNotFound(name.to_string()))
    }

    fn site(&self, name: &str) -> Result<&SiteRecord> {
        self.sites
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| SyncError::SiteNotFound(name.to_string()))
    }
}

pub struct RegistrySiteManager {
    path: Option<PathBuf>,
    registry: RwLock<Registry>,
}

impl RegistrySiteManager {
    /// Load the registry file. A missing file yields an empty registry that
    /// is created on the first commit.
    pub fn load(path: &Path) -> Result<Self> {
        let sites = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Site registry not found, starting empty");
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            registry: RwLock::new(Registry::new(sites)),
        })
    }

    /// A registry that is never written to disk.
    pub fn in_memory(sites: Vec<SiteRecord>) -> Self {
        Self {
            path: None,
            registry: RwLock::new(Registry::new(sites)),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Registry>> {
        self.registry
            .read()
            .map_err(|_| SyncError::SiteControl("site registry lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Registry>> {
        self.registry
            .write()
            .map_err(|_| SyncError::SiteControl("site registry lock poisoned".into()))
    }

    fn transition(&self, name: &str, to: ObjectState) -> Result<()> {
        let command = {
            let registry = self.read()?;
            let site = registry.site(name)?;
            match to {
                ObjectState::Started => site.start_command.clone(),
                _ => site.stop_command.clone(),
            }
        };

        if let Some(command) = command {
            run_shell(&command)
                .map_err(|e| SyncError::SiteControl(format!("site '{name}': {e}")))?;
        }

        self.write()?.site_mut(name)?.state = to;
        tracing::info!(site = name, state = ?to, "Site state changed");
        Ok(())
    }

    fn set_pool(&self, pool: &str, to: ObjectState) -> Result<()> {
        let mut registry = self.write()?;
        match registry.pools.get_mut(pool) {
            Some(state) => {
                *state = to;
                tracing::info!(pool, state = ?to, "Application pool state changed");
                Ok(())
            }
            None => Err(SyncError::SiteControl(format!("application pool '{pool}' not found"))),
        }
    }
}

fn run_shell(command: &str) -> std::result::Result<(), String> {
    #[cfg(windows)]
    let output = Command::new("cmd").args(["/C", command]).output();
    #[cfg(not(windows))]
    let output = Command::new("sh").args(["-c", command]).output();

    let output = output.map_err(|e| format!("failed to run `{command}`: {e}"))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "`{command}` exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

impl SiteManager for RegistrySiteManager {
    fn list(&self) -> Result<Vec<SiteInfo>> {
        Ok(self.read()?.sites.iter().map(SiteRecord::info).collect())
    }

    fn get(&self, name: &str) -> Result<Option<SiteInfo>> {
        Ok(self.read()?.site(name).ok().map(SiteRecord::info))
    }

    fn site_state(&self, name: &str) -> Result<ObjectState> {
        Ok(self.read()?.site(name)?.state)
    }

    fn pool_state(&self, pool: &str) -> Result<ObjectState> {
        Ok(self
            .read()?
            .pools
            .get(pool)
            .copied()
            .unwrap_or(ObjectState::Unknown))
    }

    fn start_site(&self, name: &str) -> Result<()> {
        self.transition(name, ObjectState::Started)
    }

    fn stop_site(&self, name: &str) -> Result<()> {
        self.transition(name, ObjectState::Stopped)
    }

    fn start_pool(&self, pool: &str) -> Result<()> {
        self.set_pool(pool, ObjectState::Started)
    }

    fn stop_pool(&self, pool: &str) -> Result<()> {
        self.set_pool(pool, ObjectState::Stopped)
    }

    fn add_binding(&self, name: &str, binding: Binding) -> Result<()> {
        let mut registry = self.write()?;
        let site = registry.site_mut(name)?;
        if site
            .bindings
            .iter()
            .any(|b| b.binding_information == binding.binding_information && b.protocol == binding.protocol)
        {
            return Err(SyncError::Validation(format!(
                "Binding {} already exists on '{name}'",
                binding.binding_information
            )));
        }
        site.bindings.push(binding);
        Ok(())
    }

    fn remove_binding(&self, name: &str, binding_information: &str) -> Result<bool> {
        let mut registry = self.write()?;
        let site = registry.site_mut(name)?;
        let before = site.bindings.len();
        site.bindings.retain(|b| b.binding_information != binding_information);
        Ok(site.bindings.len() != before)
    }

    fn set_physical_path(&self, name: &str, path: PathBuf) -> Result<()> {
        self.write()?.site_mut(name)?.physical_path = path;
        Ok(())
    }

    fn set_application_pool(&self, name: &str, pool: &str) -> Result<()> {
        let mut registry = self.write()?;
        let running = {
            let site = registry.site_mut(name)?;
            site.application_pool = pool.to_string();
            site.state.is_running()
        };
        let state = if running { ObjectState::Started } else { ObjectState::Stopped };
        registry.pools.entry(pool.to_string()).or_insert(state);
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&self.read()?.sites)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        tracing::debug!(path = %path.display(), "Site registry committed");
        Ok(())
    }
}
