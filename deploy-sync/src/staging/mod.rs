//! Upload sessions and staging areas.
//!
//! A session owns one staging directory under the target's physical root:
//! `<root>/__temp_uploads__/<uploadId>/` for a single site and
//! `<root>/__temp_uploads_group__/<uploadId>/` for a group, where `<root>` is
//! the physical path of the site (or of the group's first site). Chunks and
//! whole files land there until the session is finalized and merged.
//!
//! Sessions live in one concurrent map owned by [`ChunkAssembler`]; it is the
//! only state shared between requests.

pub mod chunks;

use crate::fs::paths::sanitize_relative;
use crate::utils::{Result, SyncError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

pub const STAGING_DIR: &str = "__temp_uploads__";
pub const GROUP_STAGING_DIR: &str = "__temp_uploads_group__";

/// What an upload session deploys to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UploadTarget {
    Site(String),
    Group(String),
}

impl UploadTarget {
    fn staging_dir_name(&self) -> &'static str {
        match self {
            UploadTarget::Site(_) => STAGING_DIR,
            UploadTarget::Group(_) => GROUP_STAGING_DIR,
        }
    }
}

impl fmt::Display for UploadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadTarget::Site(name) => write!(f, "site '{name}'"),
            UploadTarget::Group(name) => write!(f, "group '{name}'"),
        }
    }
}

/// Server-side bookkeeping for one upload.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub upload_id: String,
    pub target: UploadTarget,
    pub staging_dir: PathBuf,
    /// Client modification times by relative path, applied after merge.
    pub last_modified: HashMap<String, DateTime<Utc>>,
    /// Declared total sizes of chunked files, checked at reassembly.
    pub expected_sizes: HashMap<String, u64>,
    /// Group sites already deployed from this session.
    pub deployed_sites: Vec<String>,
    pub last_activity: Instant,
    /// Held while the session is reassembled and merged.
    lock: Arc<Mutex<()>>,
}

/// Exclusive hold on one session, from [`ChunkAssembler::lock_session`].
pub struct SessionGuard {
    upload_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl SessionGuard {
    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }
}

/// One chunk as received from the client.
#[derive(Debug, Clone)]
pub struct IncomingChunk {
    pub relative_path: String,
    pub index: u32,
    pub data: Vec<u8>,
    pub total_size: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Files of a finalized session, ready to merge.
#[derive(Debug, Clone)]
pub struct StagedUpload {
    pub upload_id: String,
    pub staging_dir: PathBuf,
    pub files: Vec<String>,
    pub last_modified: HashMap<String, DateTime<Utc>>,
    /// Files that could not be reassembled, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Receives chunks into staging directories and reassembles them.
#[derive(Default)]
pub struct ChunkAssembler {
    sessions: DashMap<String, UploadSession>,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session for `target`, staging under `scope_root`.
    ///
    /// Any staging area left in the same scope (e.g. by a crashed upload) is
    /// wiped first, and sessions that pointed into it are forgotten.
    pub async fn begin_session(&self, target: UploadTarget, scope_root: &Path) -> Result<String> {
        let scope = scope_root.join(target.staging_dir_name());
        if tokio::fs::try_exists(&scope).await.unwrap_or(false) {
            if let Err(e) = tokio::fs::remove_dir_all(&scope).await {
                tracing::warn!(scope = %scope.display(), error = %e, "Failed to remove stale staging directory");
            }
        }
        self.sessions.retain(|_, s| !s.staging_dir.starts_with(&scope));

        let upload_id = Uuid::new_v4().to_string();
        let staging_dir = scope.join(&upload_id);
        tokio::fs::create_dir_all(&staging_dir).await?;

        tracing::info!(upload_id = %upload_id, target = %target, staging = %staging_dir.display(), "Upload session started");

        self.sessions.insert(
            upload_id.clone(),
            UploadSession {
                upload_id: upload_id.clone(),
                target,
                staging_dir,
                last_modified: HashMap::new(),
                expected_sizes: HashMap::new(),
                deployed_sites: Vec::new(),
                last_activity: Instant::now(),
                lock: Arc::new(Mutex::new(())),
            },
        );

        Ok(upload_id)
    }

    /// Snapshot of a live session. Fails if the id is unknown or its staging
    /// directory has disappeared.
    pub async fn session(&self, upload_id: &str) -> Result<UploadSession> {
        let session = self
            .sessions
            .get(upload_id)
            .map(|s| s.clone())
            .ok_or_else(|| SyncError::UnknownUpload(upload_id.to_string()))?;

        if !tokio::fs::try_exists(&session.staging_dir).await.unwrap_or(false) {
            return Err(SyncError::UnknownUpload(upload_id.to_string()));
        }
        Ok(session)
    }

    /// Like [`session`](Self::session), also checking the session's target.
    pub async fn session_for(&self, upload_id: &str, target: &UploadTarget) -> Result<UploadSession> {
        let session = self.session(upload_id).await?;
        if &session.target != target {
            return Err(SyncError::TargetMismatch {
                upload_id: upload_id.to_string(),
                target: target.to_string(),
            });
        }
        Ok(session)
    }

    /// Store one chunk. Chunks may arrive in any order and may be re-sent.
    pub async fn receive_chunk(&self, upload_id: &str, chunk: IncomingChunk) -> Result<()> {
        let relative = sanitize_relative(&chunk.relative_path)?;
        let session = self.session(upload_id).await?;

        let fragment = session
            .staging_dir
            .join(chunks::fragment_path(&relative, chunk.index));
        write_creating_dirs(&fragment, &chunk.data).await?;

        self.touch(upload_id, |s| {
            if let Some(when) = chunk.last_modified {
                s.last_modified.insert(relative.clone(), when);
            }
            if let Some(size) = chunk.total_size {
                s.expected_sizes.insert(relative.clone(), size);
            }
        });

        tracing::debug!(upload_id, path = %relative, index = chunk.index, bytes = chunk.data.len(), "Chunk stored");
        Ok(())
    }

    /// Store a whole file, bypassing fragment reassembly.
    pub async fn receive_file(
        &self,
        upload_id: &str,
        relative_path: &str,
        data: &[u8],
        last_modified: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let relative = sanitize_relative(relative_path)?;
        let session = self.session(upload_id).await?;

        write_creating_dirs(&session.staging_dir.join(&relative), data).await?;

        self.touch(upload_id, |s| {
            if let Some(when) = last_modified {
                s.last_modified.insert(relative.clone(), when);
            }
        });

        tracing::debug!(upload_id, path = %relative, bytes = data.len(), "File stored");
        Ok(())
    }

    /// Wait for exclusive use of a session. Requests finalizing the same
    /// upload run one after another; the session may be gone once the wait
    /// is over, which is reported as an unknown upload.
    pub async fn lock_session(&self, upload_id: &str) -> Result<SessionGuard> {
        let lock = self
            .sessions
            .get(upload_id)
            .map(|s| s.lock.clone())
            .ok_or_else(|| SyncError::UnknownUpload(upload_id.to_string()))?;
        let guard = lock.lock_owned().await;

        if !self.sessions.contains_key(upload_id) {
            return Err(SyncError::UnknownUpload(upload_id.to_string()));
        }
        Ok(SessionGuard {
            upload_id: upload_id.to_string(),
            _guard: guard,
        })
    }

    /// Reassemble all chunked files of the session and list what is staged.
    ///
    /// A file that fails to reassemble is logged and left out; the rest of the
    /// session is still returned. The session itself stays alive.
    pub async fn finalize_session(&self, upload_id: &str) -> Result<StagedUpload> {
        let guard = self.lock_session(upload_id).await?;
        self.finalize_locked(&guard).await
    }

    /// [`finalize_session`](Self::finalize_session) for a caller that already
    /// holds the session.
    pub async fn finalize_locked(&self, guard: &SessionGuard) -> Result<StagedUpload> {
        let upload_id = guard.upload_id();
        let session = self.session(upload_id).await?;

        let staging_dir = session.staging_dir.clone();
        let sizes = session.expected_sizes.clone();
        let (report, files) = tokio::task::spawn_blocking(move || {
            let report = chunks::assemble_all(&staging_dir, &sizes)?;
            let files = chunks::staged_files(&staging_dir)?;
            Ok::<_, std::io::Error>((report, files))
        })
        .await
        .map_err(|e| SyncError::Task(e.to_string()))??;

        self.touch(upload_id, |_| {});

        tracing::info!(
            upload_id,
            assembled = report.assembled.len(),
            failed = report.failed.len(),
            staged = files.len(),
            "Upload session finalized"
        );

        Ok(StagedUpload {
            upload_id: upload_id.to_string(),
            staging_dir: session.staging_dir,
            files,
            last_modified: session.last_modified,
            failed: report.failed,
        })
    }

    /// Record that a group site was deployed from this session.
    pub fn mark_deployed(&self, upload_id: &str, site: &str) {
        self.touch(upload_id, |s| {
            if !s.deployed_sites.iter().any(|d| d == site) {
                s.deployed_sites.push(site.to_string());
            }
        });
    }

    /// Forget the session and delete its staging directory.
    pub async fn discard(&self, upload_id: &str) -> Option<UploadSession> {
        let (_, session) = self.sessions.remove(upload_id)?;
        remove_staging(&session).await;
        tracing::info!(upload_id, "Upload session discarded");
        Some(session)
    }

    /// Discard sessions idle for longer than `max_idle`. Returns how many.
    pub async fn sweep_idle(&self, max_idle: Duration) -> usize {
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.last_activity.elapsed() > max_idle && s.lock.try_lock().is_ok())
            .map(|s| s.upload_id.clone())
            .collect();

        let mut removed = 0;
        for upload_id in stale {
            if let Some((_, session)) = self.sessions.remove(&upload_id) {
                tracing::info!(upload_id = %upload_id, target = %session.target, "Discarding idle upload session");
                remove_staging(&session).await;
                removed += 1;
            }
        }
        removed
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn touch(&self, upload_id: &str, update: impl FnOnce(&mut UploadSession)) {
        if let Some(mut session) = self.sessions.get_mut(upload_id) {
            update(&mut session);
            session.last_activity = Instant::now();
        }
    }
}

async fn write_creating_dirs(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, data).await?;
    Ok(())
}

async fn remove_staging(session: &UploadSession) {
    if let Err(e) = tokio::fs::remove_dir_all(&session.staging_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(staging = %session.staging_dir.display(), error = %e, "Failed to delete staging directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chunk(path: &str, index: u32, data: &[u8]) -> IncomingChunk {
        IncomingChunk {
            relative_path: path.to_string(),
            index,
            data: data.to_vec(),
            total_size: None,
            last_modified: None,
        }
    }

    #[tokio::test]
    async fn test_begin_creates_staging_dir() {
        let root = TempDir::new().unwrap();
        let assembler = ChunkAssembler::new();

        let id = assembler
            .begin_session(UploadTarget::Site("shop".into()), root.path())
            .await
            .unwrap();

        let session = assembler.session(&id).await.unwrap();
        assert_eq!(session.staging_dir, root.path().join(STAGING_DIR).join(&id));
        assert!(session.staging_dir.is_dir());
    }

    #[tokio::test]
    async fn test_begin_wipes_previous_scope() {
        let root = TempDir::new().unwrap();
        let assembler = ChunkAssembler::new();
        let target = UploadTarget::Site("shop".into());

        let first = assembler.begin_session(target.clone(), root.path()).await.unwrap();
        assembler.receive_chunk(&first, chunk("a.txt", 0, b"x")).await.unwrap();
        let second = assembler.begin_session(target, root.path()).await.unwrap();

        assert!(matches!(assembler.session(&first).await, Err(SyncError::UnknownUpload(_))));
        assert!(assembler.session(&second).await.is_ok());
        assert_eq!(assembler.active_sessions(), 1);
    }

    #[tokio::test]
    async fn test_out_of_order_chunks_match_in_order() {
        let root = TempDir::new().unwrap();
        let assembler = ChunkAssembler::new();
        let parts: [&[u8]; 3] = [b"first-", b"second-", b"third"];

        let in_order = assembler.begin_session(UploadTarget::Site("a".into()), root.path()).await.unwrap();
        for (i, part) in parts.iter().enumerate() {
            assembler.receive_chunk(&in_order, chunk("lib/app.js", i as u32, part)).await.unwrap();
        }
        let staged_in_order = assembler.finalize_session(&in_order).await.unwrap();
        let expected = std::fs::read(staged_in_order.staging_dir.join("lib/app.js")).unwrap();

        let other_root = TempDir::new().unwrap();
        let shuffled = assembler.begin_session(UploadTarget::Site("b".into()), other_root.path()).await.unwrap();
        for i in [2usize, 0, 1] {
            assembler.receive_chunk(&shuffled, chunk("lib/app.js", i as u32, parts[i])).await.unwrap();
        }
        let staged_shuffled = assembler.finalize_session(&shuffled).await.unwrap();
        let actual = std::fs::read(staged_shuffled.staging_dir.join("lib/app.js")).unwrap();

        assert_eq!(expected, b"first-second-third");
        assert_eq!(actual, expected);
        assert_eq!(staged_shuffled.files, vec!["lib/app.js"]);
    }

    #[tokio::test]
    async fn test_redelivered_chunk_overwrites() {
        let root = TempDir::new().unwrap();
        let assembler = ChunkAssembler::new();
        let id = assembler.begin_session(UploadTarget::Site("a".into()), root.path()).await.unwrap();

        assembler.receive_chunk(&id, chunk("f.txt", 0, b"garbled")).await.unwrap();
        assembler.receive_chunk(&id, chunk("f.txt", 0, b"good")).await.unwrap();
        let staged = assembler.finalize_session(&id).await.unwrap();

        assert_eq!(std::fs::read(staged.staging_dir.join("f.txt")).unwrap(), b"good");
    }

    #[tokio::test]
    async fn test_records_client_times_and_whole_files() {
        let root = TempDir::new().unwrap();
        let assembler = ChunkAssembler::new();
        let id = assembler.begin_session(UploadTarget::Site("a".into()), root.path()).await.unwrap();
        let when = DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z").unwrap().with_timezone(&Utc);

        let mut c = chunk("css\\site.css", 0, b"body{}");
        c.last_modified = Some(when);
        assembler.receive_chunk(&id, c).await.unwrap();
        assembler.receive_file(&id, "robots.txt", b"User-agent: *", None).await.unwrap();

        let staged = assembler.finalize_session(&id).await.unwrap();
        assert_eq!(staged.files, vec!["css/site.css", "robots.txt"]);
        assert_eq!(staged.last_modified.get("css/site.css"), Some(&when));
    }

    #[tokio::test]
    async fn test_rejects_unknown_and_invalid() {
        let root = TempDir::new().unwrap();
        let assembler = ChunkAssembler::new();

        assert!(matches!(
            assembler.receive_chunk("nope", chunk("a", 0, b"")).await,
            Err(SyncError::UnknownUpload(_))
        ));

        let id = assembler.begin_session(UploadTarget::Group("g".into()), root.path()).await.unwrap();
        assert!(matches!(
            assembler.receive_chunk(&id, chunk("../escape", 0, b"")).await,
            Err(SyncError::InvalidPath(_))
        ));
        assert!(matches!(
            assembler.session_for(&id, &UploadTarget::Site("g".into())).await,
            Err(SyncError::TargetMismatch { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_finalize_keeps_every_file() {
        let root = TempDir::new().unwrap();
        let assembler = Arc::new(ChunkAssembler::new());
        let id = assembler.begin_session(UploadTarget::Group("g".into()), root.path()).await.unwrap();

        for f in 0..20 {
            for i in 0..20u32 {
                let data = format!("{f}:{i};");
                assembler.receive_chunk(&id, chunk(&format!("dir/file{f}.txt"), i, data.as_bytes())).await.unwrap();
            }
        }

        let first = tokio::spawn({
            let assembler = assembler.clone();
            let id = id.clone();
            async move { assembler.finalize_session(&id).await }
        });
        let second = tokio::spawn({
            let assembler = assembler.clone();
            let id = id.clone();
            async move { assembler.finalize_session(&id).await }
        });
        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();

        assert_eq!(first.files.len() + second.files.len(), 40);
        let staged = assembler.finalize_session(&id).await.unwrap();
        assert_eq!(staged.files.len(), 20);
        assert!(staged.failed.is_empty());
        let expected: String = (0..20).map(|i| format!("7:{i};")).collect();
        assert_eq!(std::fs::read_to_string(staged.staging_dir.join("dir/file7.txt")).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_lock_session_waits_and_sees_discard() {
        let root = TempDir::new().unwrap();
        let assembler = Arc::new(ChunkAssembler::new());
        let id = assembler.begin_session(UploadTarget::Site("a".into()), root.path()).await.unwrap();

        let guard = assembler.lock_session(&id).await.unwrap();
        let waiter = tokio::spawn({
            let assembler = assembler.clone();
            let id = id.clone();
            async move { assembler.finalize_session(&id).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(assembler.sweep_idle(Duration::ZERO).await, 0);

        assembler.discard(guard.upload_id()).await;
        drop(guard);

        assert!(matches!(waiter.await.unwrap(), Err(SyncError::UnknownUpload(_))));
    }

    #[tokio::test]
    async fn test_discard_and_sweep() {
        let root = TempDir::new().unwrap();
        let assembler = ChunkAssembler::new();

        let a = assembler.begin_session(UploadTarget::Site("a".into()), root.path()).await.unwrap();
        let staging = assembler.session(&a).await.unwrap().staging_dir;
        assert!(assembler.discard(&a).await.is_some());
        assert!(!staging.exists());

        let other = TempDir::new().unwrap();
        let b = assembler.begin_session(UploadTarget::Group("g".into()), other.path()).await.unwrap();
        assert_eq!(assembler.sweep_idle(Duration::from_secs(3600)).await, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(assembler.sweep_idle(Duration::from_millis(5)).await, 1);
        assert!(assembler.session(&b).await.is_err());
    }
}
