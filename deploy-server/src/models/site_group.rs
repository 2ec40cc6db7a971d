use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const GROUPS_FILE: &str = "site-groups.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteGroup {
    pub name: String,
    #[serde(default)]
    pub site_names: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub site_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateGroupRequest {
    pub site_names: Vec<String>,
}

/// `site-groups.json` in the data directory. Blocking; call from
/// `spawn_blocking`.
pub struct GroupStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl GroupStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(GROUPS_FILE),
            lock: Mutex::new(()),
        }
    }

    fn guard(&self) -> anyhow::Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| anyhow::anyhow!("group store lock poisoned"))
    }

    fn read(&self) -> anyhow::Result<Vec<SiteGroup>> {
        Ok(super::read_json(&self.path)?.unwrap_or_default())
    }

    pub fn find_all(&self) -> anyhow::Result<Vec<SiteGroup>> {
        let _guard = self.guard()?;
        self.read()
    }

    pub fn find_by_name(&self, name: &str) -> anyhow::Result<Option<SiteGroup>> {
        let _guard = self.guard()?;
        Ok(self.read()?.into_iter().find(|g| g.name == name))
    }

    /// Returns `None` when a group with that name already exists.
    pub fn create(&self, data: &CreateGroupRequest) -> anyhow::Result<Option<SiteGroup>> {
        let _guard = self.guard()?;
        let mut groups = self.read()?;
        if groups.iter().any(|g| g.name == data.name) {
            return Ok(None);
        }

        let now = Utc::now();
        let group = SiteGroup {
            name: data.name.clone(),
            site_names: data.site_names.clone(),
            created_at: now,
            last_modified_at: Some(now),
        };
        groups.push(group.clone());
        super::write_json(&self.path, &groups)?;
        Ok(Some(group))
    }

    pub fn update(&self, name: &str, data: &UpdateGroupRequest) -> anyhow::Result<Option<SiteGroup>> {
        let _guard = self.guard()?;
        let mut groups = self.read()?;
        let Some(group) = groups.iter_mut().find(|g| g.name == name) else {
            return Ok(None);
        };
        group.site_names = data.site_names.clone();
        group.last_modified_at = Some(Utc::now());
        let updated = group.clone();
        super::write_json(&self.path, &groups)?;
        Ok(Some(updated))
    }

    pub fn delete(&self, name: &str) -> anyhow::Result<bool> {
        let _guard = self.guard()?;
        let mut groups = self.read()?;
        let before = groups.len();
        groups.retain(|g| g.name != name);
        if groups.len() == before {
            return Ok(false);
        }
        super::write_json(&self.path, &groups)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(name: &str, sites: &[&str]) -> CreateGroupRequest {
        CreateGroupRequest {
            name: name.into(),
            site_names: sites.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_crud() {
        let dir = TempDir::new().unwrap();
        let store = GroupStore::new(dir.path());
        assert!(store.find_all().unwrap().is_empty());

        let created = store.create(&request("web", &["a", "b"])).unwrap().unwrap();
        assert_eq!(created.site_names, vec!["a", "b"]);
        assert!(store.create(&request("web", &[])).unwrap().is_none());

        let updated = store
            .update("web", &UpdateGroupRequest { site_names: vec!["c".into()] })
            .unwrap()
            .unwrap();
        assert_eq!(updated.site_names, vec!["c"]);
        assert_eq!(updated.created_at, created.created_at);
        assert!(store.update("nope", &UpdateGroupRequest { site_names: vec![] }).unwrap().is_none());

        assert!(store.delete("web").unwrap());
        assert!(!store.delete("web").unwrap());
        assert!(store.find_by_name("web").unwrap().is_none());
    }
}
