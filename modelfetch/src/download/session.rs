//! Top-level download session management.
//!
//! The [`DownloadManager`] owns the active-session registry (at most one
//! concurrent session per key) and exposes the control surface:
//! start / pause / resume / cancel / status / progress / list.
//!
//! Sessions are keyed by an opaque caller-chosen string, typically a model
//! identifier. The one-active-session-per-key invariant is an atomic
//! check-and-insert on a concurrent map, not a global lock; unrelated
//! downloads never serialize on each other. A second, system-wide semaphore
//! caps how many repository downloads run at once — later sessions queue
//! for a permit rather than failing.
//!
//! Status queries for keys with no in-memory session fall back to disk
//! inspection (markers + actual file sizes), which is what keeps answers
//! correct across process restarts.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{DownloadError, DownloadResult};
use super::progress::{FileProgress, RepoProgress};
use super::repo::RepoDownloader;
use super::source::{DownloadTarget, RemoteFileSource};
use super::state::{self, RecoveredTarget};
use crate::config::DownloadConfig;

/// Status of a download session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// An in-memory session is actively transferring.
    Downloading,
    /// No active session, but incomplete markers exist on disk.
    Paused,
    /// Everything for this key is on disk.
    Completed,
    /// The last session for this key ended in an error.
    Failed,
    /// Nothing known about this key, in memory or on disk.
    NotFound,
}

/// Summary of one known download, active or recoverable from disk.
#[derive(Debug, Clone)]
pub struct DownloadInfo {
    /// Session key.
    pub key: String,
    /// Current status.
    pub status: SessionStatus,
    /// Latest progress snapshot, if one can be produced.
    pub progress: Option<RepoProgress>,
}

/// Monotonic id distinguishing session generations for the same key.
static SESSION_IDS: AtomicU64 = AtomicU64::new(0);

struct ActiveSession {
    id: u64,
    cancel: CancellationToken,
    progress: watch::Receiver<RepoProgress>,
}

#[derive(Debug, Clone)]
enum SessionOutcome {
    Completed,
    Failed(String),
}

/// Facade over the download subsystem, tracked by session key.
pub struct DownloadManager {
    source: Arc<dyn RemoteFileSource>,
    config: DownloadConfig,
    sessions: Arc<DashMap<String, ActiveSession>>,
    outcomes: Arc<DashMap<String, SessionOutcome>>,
    /// Latest driver task per key. A new session awaits its predecessor
    /// here: a just-paused transfer may still be flushing buffered bytes,
    /// and resume offsets come from the file length on disk.
    drivers: Arc<DashMap<String, JoinHandle<()>>>,
    session_permits: Arc<Semaphore>,
}

impl DownloadManager {
    /// Create a manager over the given remote source.
    pub fn new(source: Arc<dyn RemoteFileSource>, config: DownloadConfig) -> Self {
        let session_permits = Arc::new(Semaphore::new(config.max_sessions));
        Self {
            source,
            config,
            sessions: Arc::new(DashMap::new()),
            outcomes: Arc::new(DashMap::new()),
            drivers: Arc::new(DashMap::new()),
            session_permits,
        }
    }

    /// Directory holding one session's files and markers.
    pub fn session_dir(&self, key: &str) -> PathBuf {
        self.config.models_root.join(sanitize_key(key))
    }

    /// Start a new download session for `key`.
    ///
    /// # Errors
    ///
    /// [`DownloadError::SessionConflict`] if a session for `key` is already
    /// active. No side effects in that case.
    pub fn start(&self, key: &str, targets: Vec<DownloadTarget>) -> DownloadResult<()> {
        self.launch(key, targets)
    }

    /// Resume a paused or interrupted download session for `key`.
    ///
    /// Identical to [`start`](Self::start) from this layer's point of view:
    /// every file re-derives its own start offset from the current on-disk
    /// length, never from a remembered in-memory value, so a resume after a
    /// process restart behaves the same as one after a pause.
    pub fn resume(&self, key: &str, targets: Vec<DownloadTarget>) -> DownloadResult<()> {
        self.launch(key, targets)
    }

    fn launch(&self, key: &str, targets: Vec<DownloadTarget>) -> DownloadResult<()> {
        let entry = match self.sessions.entry(key.to_string()) {
            Entry::Occupied(_) => {
                return Err(DownloadError::SessionConflict {
                    key: key.to_string(),
                })
            }
            Entry::Vacant(vacant) => vacant,
        };

        let id = SESSION_IDS.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let files = targets.iter().map(|t| t.name.clone()).collect();
        let (tx, rx) = watch::channel(RepoProgress {
            files,
            ..RepoProgress::default()
        });

        entry.insert(ActiveSession {
            id,
            cancel: cancel.clone(),
            progress: rx,
        });
        // A fresh run supersedes any recorded outcome for this key.
        self.outcomes.remove(key);

        info!(key, files = targets.len(), "registered download session");

        let orchestrator = RepoDownloader::new(Arc::clone(&self.source), self.config.clone());
        let sessions = Arc::clone(&self.sessions);
        let outcomes = Arc::clone(&self.outcomes);
        let permits = Arc::clone(&self.session_permits);
        let prior = self.drivers.remove(key).map(|(_, handle)| handle);
        let driver_key = key.to_string();
        let key = key.to_string();

        let driver = tokio::spawn(async move {
            // The previous generation for this key may still be winding
            // down after a pause; its final buffer flush has to land
            // before any offset is read from disk.
            if let Some(prior) = prior {
                let _ = prior.await;
            }

            // System-wide session cap, independent of per-repo file
            // concurrency. Later sessions queue here.
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            if cancel.is_cancelled() {
                sessions.remove_if(&key, |_, s| s.id == id);
                return;
            }

            let download = orchestrator.download_all(&key, targets, cancel.clone());
            let mut progress = download.progress();

            let forward = async {
                while progress.changed().await.is_ok() {
                    let snapshot = progress.borrow().clone();
                    let terminal = snapshot.completed;
                    tx.send_replace(snapshot);
                    if terminal {
                        break;
                    }
                }
            };

            let (result, ()) = tokio::join!(download.wait(), forward);

            match result {
                Ok(()) => {
                    info!(key, "download session completed");
                    outcomes.insert(key.clone(), SessionOutcome::Completed);
                }
                Err(e) if e.is_cancelled() => {
                    debug!(key, "download session stopped");
                }
                Err(e) => {
                    warn!(key, error = %e, "download session failed");
                    outcomes.insert(key.clone(), SessionOutcome::Failed(e.to_string()));
                }
            }

            // Deregister only our own generation; a pause may already have
            // removed it, and a newer session may have taken the key since.
            sessions.remove_if(&key, |_, s| s.id == id);
        });
        self.drivers.insert(driver_key, driver);

        Ok(())
    }

    /// Pause the active session for `key`.
    ///
    /// Cooperative: cancels the session token (which propagates into every
    /// in-flight file transfer) and removes the session from the registry.
    /// Markers and partially written files stay on disk as the resume
    /// point. Returns `false` if no active session exists.
    pub fn pause(&self, key: &str) -> bool {
        match self.sessions.remove(key) {
            Some((_, session)) => {
                session.cancel.cancel();
                info!(key, "paused download session");
                true
            }
            None => false,
        }
    }

    /// Cancel the download for `key`.
    ///
    /// Same cooperative stop as [`pause`](Self::pause), but additionally
    /// discards persisted state: every marker under the session directory
    /// is removed, so the download no longer reports as resumable. Partial
    /// files themselves are left on disk. Returns `true` if an active
    /// session was stopped; marker cleanup happens either way.
    pub fn cancel(&self, key: &str) -> bool {
        let was_active = match self.sessions.remove(key) {
            Some((_, session)) => {
                session.cancel.cancel();
                true
            }
            None => false,
        };

        for recovered in state::scan_session_dir(&self.session_dir(key)) {
            state::remove_marker(&recovered.dest);
        }
        self.outcomes.remove(key);
        info!(key, was_active, "cancelled download session");
        was_active
    }

    /// Current status for `key`.
    ///
    /// Falls back to disk inspection when no in-memory session exists, so
    /// the answer stays correct across process restarts.
    pub fn status(&self, key: &str) -> SessionStatus {
        if self.sessions.contains_key(key) {
            return SessionStatus::Downloading;
        }
        if let Some(outcome) = self.outcomes.get(key) {
            return match outcome.value() {
                SessionOutcome::Completed => SessionStatus::Completed,
                SessionOutcome::Failed(_) => SessionStatus::Failed,
            };
        }
        self.status_from_disk(key)
    }

    /// Error message of the last failed session for `key`, if any.
    pub fn last_error(&self, key: &str) -> Option<String> {
        match self.outcomes.get(key).map(|o| o.value().clone()) {
            Some(SessionOutcome::Failed(message)) => Some(message),
            _ => None,
        }
    }

    /// Latest progress snapshot for `key`.
    ///
    /// For an active session this is the orchestrator's latest snapshot;
    /// otherwise one is synthesized from markers and actual on-disk sizes.
    pub fn progress(&self, key: &str) -> Option<RepoProgress> {
        if let Some(session) = self.sessions.get(key) {
            return Some(session.progress.borrow().clone());
        }
        self.progress_from_disk(key)
    }

    /// A progress receiver for an active session, for callers that want to
    /// follow snapshots instead of polling.
    pub fn watch(&self, key: &str) -> Option<watch::Receiver<RepoProgress>> {
        self.sessions.get(key).map(|s| s.progress.clone())
    }

    /// Every known download: active sessions plus sessions recoverable
    /// from on-disk markers.
    pub fn list(&self) -> Vec<DownloadInfo> {
        let mut infos: Vec<DownloadInfo> = self
            .sessions
            .iter()
            .map(|entry| DownloadInfo {
                key: entry.key().clone(),
                status: SessionStatus::Downloading,
                progress: Some(entry.value().progress.borrow().clone()),
            })
            .collect();

        // Recoverable sessions: any models_root subdirectory with markers
        // whose key has no active session. The marker records its own key,
        // so directory names never need to be un-sanitized.
        let entries = match std::fs::read_dir(&self.config.models_root) {
            Ok(entries) => entries,
            Err(_) => return infos,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let recovered = state::scan_session_dir(&path);
            let Some(first) = recovered.first() else {
                continue;
            };
            let key = first.marker.session_key.clone();
            if self.sessions.contains_key(&key) {
                continue;
            }
            let status = if recovered.iter().all(RecoveredTarget::is_complete) {
                SessionStatus::Completed
            } else {
                SessionStatus::Paused
            };
            infos.push(DownloadInfo {
                key: key.clone(),
                status,
                progress: Some(synthesize_progress(&recovered)),
            });
        }

        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    fn status_from_disk(&self, key: &str) -> SessionStatus {
        let dir = self.session_dir(key);
        let recovered = state::scan_session_dir(&dir);
        if !recovered.is_empty() {
            return if recovered.iter().all(RecoveredTarget::is_complete) {
                SessionStatus::Completed
            } else {
                SessionStatus::Paused
            };
        }
        // Zero remaining markers: completed if the directory holds files.
        match std::fs::read_dir(&dir) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    SessionStatus::Completed
                } else {
                    SessionStatus::NotFound
                }
            }
            Err(_) => SessionStatus::NotFound,
        }
    }

    fn progress_from_disk(&self, key: &str) -> Option<RepoProgress> {
        let recovered = state::scan_session_dir(&self.session_dir(key));
        if recovered.is_empty() {
            return None;
        }
        Some(synthesize_progress(&recovered))
    }
}

/// Build a progress snapshot from disk state alone.
///
/// Downloaded byte counts come from real file sizes, never from the
/// markers' diagnostic counters.
fn synthesize_progress(recovered: &[RecoveredTarget]) -> RepoProgress {
    let mut progress = RepoProgress::default();
    for target in recovered {
        let name = target
            .dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        progress.files.insert(name.clone());
        if target.is_complete() {
            progress.completed_files.insert(name);
        } else {
            progress.active.push(FileProgress {
                name,
                path: target.dest.clone(),
                completed: false,
                bytes_downloaded: target.on_disk,
                total_bytes: (target.marker.total_size > 0).then_some(target.marker.total_size),
                bytes_per_sec: 0.0,
            });
        }
    }
    progress
}

/// Map a session key to a file-system-safe directory name.
///
/// Hub model ids contain `/` (e.g. `org/model`); those become `--`, and
/// anything else path-hostile becomes `_`.
pub fn sanitize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        match c {
            '/' => out.push_str("--"),
            c if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') => out.push(c),
            _ => out.push('_'),
        }
    }
    out
}
