use deploy_sync::IgnorePatterns;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub const SETTINGS_FILE: &str = "ManagerSettings.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagerSettings {
    pub organization_name: String,
    pub theme: String,
    pub language: String,
    pub enable_notifications: bool,
    pub refresh_interval: u32,
    pub connection_limit: u32,
    pub server_url: String,
    pub enable_logging: bool,
    #[serde(rename = "enableSSL")]
    pub enable_ssl: bool,
    pub ignored_files: Vec<String>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            organization_name: "Minha Empresa".into(),
            theme: "light".into(),
            language: "pt-BR".into(),
            enable_notifications: true,
            refresh_interval: 30,
            connection_limit: 100,
            server_url: "https://localhost:5001".into(),
            enable_logging: true,
            enable_ssl: true,
            ignored_files: Vec::new(),
        }
    }
}

/// `ManagerSettings.json` in the data directory. Blocking; call from
/// `spawn_blocking`.
pub struct SettingsStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SettingsStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(SETTINGS_FILE),
            write_lock: Mutex::new(()),
        }
    }

    /// Current settings. A missing file is created with the defaults.
    pub fn load(&self) -> anyhow::Result<ManagerSettings> {
        if let Some(settings) = super::read_json(&self.path)? {
            return Ok(settings);
        }
        let _guard = self.lock()?;
        self.load_locked()
    }

    pub fn save(&self, settings: &ManagerSettings) -> anyhow::Result<()> {
        let _guard = self.lock()?;
        super::write_json(&self.path, settings)
    }

    /// Read, change and write back the settings under one lock.
    pub fn update(&self, change: impl FnOnce(&mut ManagerSettings)) -> anyhow::Result<ManagerSettings> {
        let _guard = self.lock()?;
        let mut settings = self.load_locked()?;
        change(&mut settings);
        super::write_json(&self.path, &settings)?;
        Ok(settings)
    }

    pub fn set_ignored_files(&self, ignored_files: Vec<String>) -> anyhow::Result<ManagerSettings> {
        self.update(|s| s.ignored_files = ignored_files)
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("settings lock poisoned"))
    }

    /// Caller holds `write_lock`.
    fn load_locked(&self) -> anyhow::Result<ManagerSettings> {
        if let Some(settings) = super::read_json(&self.path)? {
            return Ok(settings);
        }
        let settings = ManagerSettings::default();
        super::write_json(&self.path, &settings)?;
        tracing::info!(path = %self.path.display(), "Created default settings file");
        Ok(settings)
    }

    /// Snapshot of the exclusion patterns for one sync operation.
    pub fn ignore_patterns(&self) -> anyhow::Result<IgnorePatterns> {
        Ok(IgnorePatterns::new(self.load()?.ignored_files))
    }
}
