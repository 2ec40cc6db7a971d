//! Server configuration.
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables (a `.env` file is honoured), then by command-line flags.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub sites: SitesConfig,
    pub uploads: UploadsConfig,
    pub backup: BackupConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP port
    pub port: u16,

    /// Directory for ManagerSettings.json and site-groups.json
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SitesConfig {
    /// JSON registry of hosted sites
    pub registry_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadsConfig {
    /// Sessions without activity for this long are discarded
    pub session_idle_timeout_secs: u64,

    /// How often the idle-session sweep runs
    pub sweep_interval_secs: u64,

    /// Request body limit for upload endpoints
    pub max_chunk_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// zstd level (1-22)
    pub compression_level: i32,

    /// Name of the backup directory created next to each site
    pub directory_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5135,
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl Default for SitesConfig {
    fn default() -> Self {
        Self {
            registry_file: PathBuf::from("./data/sites.json"),
        }
    }
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            session_idle_timeout_secs: 3600,
            sweep_interval_secs: 300,
            max_chunk_bytes: 64 * 1024 * 1024,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            compression_level: 3,
            directory_name: "backups".to_string(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// File (or defaults), then environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(port) = var("PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(dir) = var("DATA_DIR") {
            self.server.data_dir = PathBuf::from(dir);
        }
        if let Some(file) = var("SITES_FILE") {
            self.sites.registry_file = PathBuf::from(file);
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.log.level = level;
        }
    }
}
