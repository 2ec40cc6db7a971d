//! Deployment orchestration.
//!
//! One deploy of one site runs strictly in this order:
//!
//! ```text
//! stop site, stop pool -> backup -> merge -> restore dates -> start pool, start site
//! ```
//!
//! Site and pool are only stopped if they were running, and only started
//! again if they were running before. The restart step runs whether or not
//! the earlier steps succeeded. A backup must exist before the live directory
//! is touched; if it cannot be written the deploy is aborted.
//!
//! Single-site deploys move staged files, group deploys copy them so every
//! site of the group can be served from one upload.

pub mod events;
pub mod merge;

use crate::archive::Archiver;
use crate::filter::IgnorePatterns;
use crate::sites::SiteManager;
use crate::staging::{ChunkAssembler, StagedUpload, UploadTarget};
use crate::utils::{Result, SyncError};
use dashmap::DashMap;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

pub use events::{DeployEvent, DeployEvents, DeployStage, NoopEvents};
pub use merge::MergeReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Move,
    Copy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub path: String,
    pub reason: String,
}

impl From<(String, String)> for FileFailure {
    fn from((path, reason): (String, String)) -> Self {
        Self { path, reason }
    }
}

/// Result of a successful single-site deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployOutcome {
    pub site: String,
    pub backup_file: PathBuf,
    pub merged: Vec<String>,
    pub skipped: Vec<String>,
    /// Files that could not be reassembled, merged or re-dated.
    pub failed: Vec<FileFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteDeployResult {
    pub site: String,
    pub success: bool,
    pub backup_file: Option<PathBuf>,
    pub merged: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupDeployReport {
    pub results: Vec<SiteDeployResult>,
    pub backups: Vec<PathBuf>,
    /// Sites deployed earlier through the same session.
    pub already_deployed: Vec<String>,
}

impl GroupDeployReport {
    pub fn errors(&self) -> Vec<String> {
        self.results
            .iter()
            .filter_map(|r| r.error.as_ref().map(|e| format!("{}: {}", r.site, e)))
            .collect()
    }
}

#[derive(Debug, Clone)]
struct PriorState {
    site_running: bool,
    pool: Option<String>,
    pool_running: bool,
}

impl PriorState {
    fn running_pool(&self) -> Option<&str> {
        self.pool.as_deref().filter(|_| self.pool_running)
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::Task(e.to_string()))?
}

pub struct Deployer {
    sites: Arc<dyn SiteManager>,
    archiver: Arc<dyn Archiver>,
    events: Arc<dyn DeployEvents>,
    sessions: Arc<ChunkAssembler>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Deployer {
    pub fn new(
        sites: Arc<dyn SiteManager>,
        archiver: Arc<dyn Archiver>,
        events: Arc<dyn DeployEvents>,
        sessions: Arc<ChunkAssembler>,
    ) -> Self {
        Self {
            sites,
            archiver,
            events,
            sessions,
            locks: DashMap::new(),
        }
    }

    pub fn sessions(&self) -> &Arc<ChunkAssembler> {
        &self.sessions
    }

    pub fn sites(&self) -> &Arc<dyn SiteManager> {
        &self.sites
    }

    /// Finalize a single-site upload and move it into the site.
    /// The session is discarded afterwards, whatever the outcome.
    pub async fn finalize_site(
        &self,
        upload_id: &str,
        site: &str,
        patterns: &IgnorePatterns,
    ) -> Result<DeployOutcome> {
        self.sessions
            .session_for(upload_id, &UploadTarget::Site(site.to_string()))
            .await?;
        let guard = self.sessions.lock_session(upload_id).await?;

        let result = match self.sessions.finalize_locked(&guard).await {
            Ok(staged) => self.deploy_site(site, &staged, TransferMode::Move, patterns).await,
            Err(e) => Err(e),
        };

        self.sessions.discard(upload_id).await;
        result
    }

    /// Deploy one site of a group upload. The session stays open for the
    /// remaining sites.
    pub async fn finalize_group_site(
        &self,
        upload_id: &str,
        group: &str,
        site: &str,
        patterns: &IgnorePatterns,
    ) -> Result<DeployOutcome> {
        self.sessions
            .session_for(upload_id, &UploadTarget::Group(group.to_string()))
            .await?;
        let guard = self.sessions.lock_session(upload_id).await?;

        let staged = self.sessions.finalize_locked(&guard).await?;
        let outcome = self.deploy_site(site, &staged, TransferMode::Copy, patterns).await?;
        self.sessions.mark_deployed(upload_id, site);
        Ok(outcome)
    }

    /// Deploy every site of `group` not yet deployed through this session,
    /// then discard the session.
    pub async fn finalize_group(
        &self,
        upload_id: &str,
        group: &str,
        sites: &[String],
        patterns: &IgnorePatterns,
    ) -> Result<GroupDeployReport> {
        let target = UploadTarget::Group(group.to_string());
        self.sessions.session_for(upload_id, &target).await?;
        let guard = self.sessions.lock_session(upload_id).await?;
        // Re-read under the lock: a per-site finalize may just have finished.
        let session = self.sessions.session_for(upload_id, &target).await?;

        let staged = match self.sessions.finalize_locked(&guard).await {
            Ok(staged) => staged,
            Err(e) => {
                self.sessions.discard(upload_id).await;
                return Err(e);
            }
        };

        let (done, remaining): (Vec<String>, Vec<String>) = sites
            .iter()
            .cloned()
            .partition(|s| session.deployed_sites.contains(s));

        let mut report = self
            .deploy_sites(&remaining, &staged, TransferMode::Copy, patterns)
            .await;
        report.already_deployed = done;

        self.sessions.discard(upload_id).await;

        tracing::info!(
            upload_id,
            group,
            deployed = report.results.iter().filter(|r| r.success).count(),
            failed = report.results.iter().filter(|r| !r.success).count(),
            "Group deploy finished"
        );
        Ok(report)
    }

    /// Deploy to each site in turn. A failing site is recorded and the next
    /// one is still processed.
    pub async fn deploy_sites(
        &self,
        sites: &[String],
        staged: &StagedUpload,
        mode: TransferMode,
        patterns: &IgnorePatterns,
    ) -> GroupDeployReport {
        let mut report = GroupDeployReport::default();

        for site in sites {
            match self.deploy_site(site, staged, mode, patterns).await {
                Ok(outcome) => {
                    report.backups.push(outcome.backup_file.clone());
                    report.results.push(SiteDeployResult {
                        site: site.clone(),
                        success: true,
                        backup_file: Some(outcome.backup_file),
                        merged: outcome.merged.len(),
                        error: None,
                    });
                }
                Err(e) => {
                    report.results.push(SiteDeployResult {
                        site: site.clone(),
                        success: false,
                        backup_file: None,
                        merged: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        report
    }

    /// Run the full deploy sequence for one site.
    pub async fn deploy_site(
        &self,
        site: &str,
        staged: &StagedUpload,
        mode: TransferMode,
        patterns: &IgnorePatterns,
    ) -> Result<DeployOutcome> {
        let lock = self.lock_for(site);
        let _guard = lock.lock().await;

        let (physical_path, prior) = self.inspect(site).await?;

        tracing::info!(
            site,
            upload_id = %staged.upload_id,
            mode = ?mode,
            files = staged.files.len(),
            "Deploy started"
        );

        let result = self
            .stop_backup_merge(site, physical_path, staged, mode, patterns, &prior)
            .await;

        self.emit_stage(site, staged, DeployStage::Starting);
        let restart = self.restore_state(site, &prior).await;

        let outcome = match (result, restart) {
            (Ok(outcome), Ok(())) => outcome,
            (Ok(_), Err(e)) => return Err(self.fail(site, staged, e)),
            (Err(e), restart) => {
                if let Err(restart_err) = restart {
                    tracing::error!(site, error = %restart_err, "Failed to restore site state after failed deploy");
                }
                return Err(self.fail(site, staged, e));
            }
        };

        tracing::info!(
            site,
            upload_id = %staged.upload_id,
            backup = %outcome.backup_file.display(),
            merged = outcome.merged.len(),
            failed = outcome.failed.len(),
            "Deploy completed"
        );
        self.events.emit(DeployEvent::Completed {
            site: site.to_string(),
            upload_id: staged.upload_id.clone(),
            backup_file: outcome.backup_file.clone(),
            merged: outcome.merged.len(),
        });
        Ok(outcome)
    }

    fn lock_for(&self, site: &str) -> Arc<Mutex<()>> {
        self.locks.entry(site.to_string()).or_default().clone()
    }

    /// Resolve the physical path and record the running state. No side effects.
    async fn inspect(&self, site: &str) -> Result<(PathBuf, PriorState)> {
        let sites = self.sites.clone();
        let name = site.to_string();
        blocking(move || {
            let info = sites
                .get(&name)?
                .ok_or_else(|| SyncError::SiteNotFound(name.clone()))?;
            if info.physical_path.as_os_str().is_empty() || !info.physical_path.is_dir() {
                return Err(SyncError::MissingPhysicalPath(name));
            }

            let site_running = sites.site_state(&name)?.is_running();
            let pool = Some(info.application_pool).filter(|p| !p.is_empty());
            let pool_running = match &pool {
                Some(p) => sites.pool_state(p)?.is_running(),
                None => false,
            };

            Ok((
                info.physical_path,
                PriorState {
                    site_running,
                    pool,
                    pool_running,
                },
            ))
        })
        .await
    }

    async fn stop_backup_merge(
        &self,
        site: &str,
        physical_path: PathBuf,
        staged: &StagedUpload,
        mode: TransferMode,
        patterns: &IgnorePatterns,
        prior: &PriorState,
    ) -> Result<DeployOutcome> {
        self.emit_stage(site, staged, DeployStage::Stopping);
        {
            let sites = self.sites.clone();
            let name = site.to_string();
            let prior = prior.clone();
            blocking(move || {
                if prior.site_running {
                    sites.stop_site(&name)?;
                }
                if let Some(pool) = prior.running_pool() {
                    sites.stop_pool(pool)?;
                }
                Ok(())
            })
            .await?;
        }

        self.emit_stage(site, staged, DeployStage::BackingUp);
        let backup_file = {
            let archiver = self.archiver.clone();
            let name = site.to_string();
            let root = physical_path.clone();
            blocking(move || archiver.create_backup(&name, &root)).await?
        };
        tracing::info!(site, backup = %backup_file.display(), "Backup created");

        self.emit_stage(site, staged, DeployStage::Merging);
        let report = {
            let staging_dir = staged.staging_dir.clone();
            let files = staged.files.clone();
            let root = physical_path.clone();
            let patterns = patterns.clone();
            blocking(move || merge::merge_staged(&staging_dir, &files, &root, mode, &patterns)).await?
        };

        self.emit_stage(site, staged, DeployStage::RestoringDates);
        let date_failures = {
            let root = physical_path;
            let merged = report.merged.clone();
            let times = staged.last_modified.clone();
            blocking(move || Ok(merge::restore_dates(&root, &merged, &times))).await?
        };

        let failed = staged
            .failed
            .iter()
            .cloned()
            .chain(report.failed)
            .chain(date_failures)
            .map(FileFailure::from)
            .collect();

        Ok(DeployOutcome {
            site: site.to_string(),
            backup_file,
            merged: report.merged,
            skipped: report.skipped,
            failed,
        })
    }

    /// Start pool then site, each only if it was running before.
    async fn restore_state(&self, site: &str, prior: &PriorState) -> Result<()> {
        let sites = self.sites.clone();
        let name = site.to_string();
        let prior = prior.clone();
        blocking(move || {
            let mut first_error = None;
            if let Some(pool) = prior.running_pool() {
                if let Err(e) = sites.start_pool(pool) {
                    tracing::error!(pool, error = %e, "Failed to start application pool");
                    first_error = Some(e);
                }
            }
            if prior.site_running {
                if let Err(e) = sites.start_site(&name) {
                    tracing::error!(site = %name, error = %e, "Failed to start site");
                    first_error.get_or_insert(e);
                }
            }
            match first_error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
        .await
    }

    fn emit_stage(&self, site: &str, staged: &StagedUpload, stage: DeployStage) {
        tracing::debug!(site, upload_id = %staged.upload_id, stage = ?stage, "Deploy stage");
        self.events.emit(DeployEvent::Stage {
            site: site.to_string(),
            upload_id: staged.upload_id.clone(),
            stage,
        });
    }

    fn fail(&self, site: &str, staged: &StagedUpload, error: SyncError) -> SyncError {
        tracing::error!(site, upload_id = %staged.upload_id, error = %error, "Deploy failed");
        self.events.emit(DeployEvent::Failed {
            site: site.to_string(),
            upload_id: staged.upload_id.clone(),
            error: error.to_string(),
        });
        error
    }
}
