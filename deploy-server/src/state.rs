use crate::config::AppConfig;
use crate::error::AppError;
use crate::models::settings::SettingsStore;
use crate::models::site_group::{GroupStore, SiteGroup};
use crate::ws::ui::UiBroadcaster;
use deploy_sync::archive::TarZstdArchiver;
use deploy_sync::sites::SiteManager;
use deploy_sync::staging::ChunkAssembler;
use deploy_sync::{Deployer, IgnorePatterns};
use std::path::PathBuf;
use std::sync::Arc;

pub struct AppState {
    pub config: AppConfig,
    pub ui: UiBroadcaster,
    pub sites: Arc<dyn SiteManager>,
    pub sessions: Arc<ChunkAssembler>,
    pub deployer: Arc<Deployer>,
    pub settings: Arc<SettingsStore>,
    pub groups: Arc<GroupStore>,
}

impl AppState {
    pub fn new(config: AppConfig, sites: Arc<dyn SiteManager>) -> Self {
        let ui = UiBroadcaster::new();
        let sessions = Arc::new(ChunkAssembler::new());
        let archiver = Arc::new(TarZstdArchiver::new(
            config.backup.compression_level,
            config.backup.directory_name.clone(),
        ));
        let deployer = Arc::new(Deployer::new(
            sites.clone(),
            archiver,
            Arc::new(ui.clone()),
            sessions.clone(),
        ));
        Self {
            settings: Arc::new(SettingsStore::new(&config.server.data_dir)),
            groups: Arc::new(GroupStore::new(&config.server.data_dir)),
            config,
            ui,
            sites,
            sessions,
            deployer,
        }
    }

    /// Fresh snapshot of the configured exclusion patterns.
    pub async fn ignore_patterns(&self) -> Result<IgnorePatterns, AppError> {
        let settings = self.settings.clone();
        let patterns = tokio::task::spawn_blocking(move || settings.ignore_patterns())
            .await
            .map_err(|e| anyhow::anyhow!(e))??;
        Ok(patterns)
    }

    pub async fn group(&self, name: &str) -> Result<SiteGroup, AppError> {
        let groups = self.groups.clone();
        let name = name.to_string();
        let group = tokio::task::spawn_blocking(move || groups.find_by_name(&name))
            .await
            .map_err(|e| anyhow::anyhow!(e))??;
        group.ok_or_else(|| AppError::NotFound("Group not found".into()))
    }

    /// Physical path of a site. 404 for unknown sites, 500 when the
    /// configured path does not resolve to a directory.
    pub async fn physical_path(&self, site: &str) -> Result<PathBuf, AppError> {
        let sites = self.sites.clone();
        let name = site.to_string();
        let info = tokio::task::spawn_blocking(move || sites.get(&name))
            .await
            .map_err(|e| anyhow::anyhow!(e))??;
        let info = info.ok_or_else(|| AppError::NotFound(format!("Site '{site}' not found")))?;
        if info.physical_path.as_os_str().is_empty() || !info.physical_path.is_dir() {
            return Err(deploy_sync::SyncError::MissingPhysicalPath(site.to_string()).into());
        }
        Ok(info.physical_path)
    }

    /// The site whose directory hosts the group's staging area.
    pub fn group_host_site(group: &SiteGroup) -> Result<&str, AppError> {
        group
            .site_names
            .first()
            .map(String::as_str)
            .ok_or_else(|| AppError::BadRequest(format!("Group '{}' has no sites", group.name)))
    }
}
