//! Repository download orchestration.
//!
//! Downloads a set of files concurrently under a bounded worker pool:
//!
//! ```text
//! RepoDownloader::download_all
//!         │
//!         ├── N × download task ──► Semaphore (max_file_concurrency)
//!         │         │
//!         │         ├── resume decision from disk (state)
//!         │         ├── marker write (state)
//!         │         └── FileDownloader ──► RemoteFileSource
//!         │
//!         └── monitor loop ──► watch::Sender<RepoProgress>
//! ```
//!
//! Progress is aggregated from a lock-free per-file map into immutable
//! [`RepoProgress`] snapshots at a fixed poll interval; consumers pull them
//! from a `watch` channel and never observe a snapshot under mutation.
//!
//! Failure policy is all-or-nothing. An authentication error aborts the
//! whole repository immediately, cancelling in-flight transfers. Any other
//! failure lets the remaining admitted transfers run to completion, then the
//! first failure encountered is reported once everything has settled.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::checksum::verify_checksum;
use super::error::{DownloadError, DownloadResult};
use super::file::{FileDownloader, FileProgressCallback};
use super::progress::{FileProgress, RepoProgress};
use super::source::{DownloadTarget, RemoteFileSource};
use super::state::{self, DownloadMarker, ResumeDecision};
use crate::config::DownloadConfig;

/// A running repository download: a progress snapshot channel plus a handle
/// to the final result.
pub struct RepoDownload {
    progress: watch::Receiver<RepoProgress>,
    handle: JoinHandle<DownloadResult<()>>,
}

impl RepoDownload {
    /// Receiver for progress snapshots. The terminal snapshot (and only the
    /// terminal one) has `completed == true`.
    pub fn progress(&self) -> watch::Receiver<RepoProgress> {
        self.progress.clone()
    }

    /// Wait for the whole repository download to settle.
    pub async fn wait(self) -> DownloadResult<()> {
        self.handle
            .await
            .map_err(|e| DownloadError::TaskFailed(e.to_string()))?
    }
}

/// State shared between download tasks and the monitor loop.
struct SharedProgress {
    /// In-flight per-file progress, keyed by file name. Different transfers
    /// never touch the same key.
    per_file: DashMap<String, FileProgress>,
    /// Files that have finished.
    completed: Mutex<BTreeSet<String>>,
    /// First terminal failure. Auth errors displace non-auth ones;
    /// cancellations are never recorded.
    first_error: Mutex<Option<DownloadError>>,
}

impl SharedProgress {
    fn new() -> Self {
        Self {
            per_file: DashMap::new(),
            completed: Mutex::new(BTreeSet::new()),
            first_error: Mutex::new(None),
        }
    }

    fn record_error(&self, err: DownloadError) {
        if err.is_cancelled() {
            return;
        }
        let mut slot = self.first_error.lock();
        match (&*slot, err.is_auth()) {
            (None, _) => *slot = Some(err),
            (Some(existing), true) if !existing.is_auth() => *slot = Some(err),
            _ => {}
        }
    }

    fn snapshot(&self, files: &BTreeSet<String>, completed_flag: bool) -> RepoProgress {
        RepoProgress {
            files: files.clone(),
            completed_files: self.completed.lock().clone(),
            active: self.per_file.iter().map(|e| e.value().clone()).collect(),
            completed: completed_flag,
        }
    }
}

/// Orchestrates concurrent file downloads for one repository.
pub struct RepoDownloader {
    source: Arc<dyn RemoteFileSource>,
    config: DownloadConfig,
}

impl RepoDownloader {
    /// Create an orchestrator over the given remote source.
    pub fn new(source: Arc<dyn RemoteFileSource>, config: DownloadConfig) -> Self {
        Self { source, config }
    }

    /// Download all targets for `session_key`, admission-controlled by a
    /// semaphore of `max_file_concurrency` permits.
    ///
    /// Returns immediately; drive the returned [`RepoDownload`] for
    /// progress and the final result.
    pub fn download_all(
        &self,
        session_key: &str,
        targets: Vec<DownloadTarget>,
        cancel: CancellationToken,
    ) -> RepoDownload {
        let files: BTreeSet<String> = targets.iter().map(|t| t.name.clone()).collect();
        let (tx, rx) = watch::channel(RepoProgress {
            files: files.clone(),
            ..RepoProgress::default()
        });

        let handle = tokio::spawn(run_repo_download(
            Arc::clone(&self.source),
            self.config.clone(),
            session_key.to_string(),
            targets,
            files,
            cancel,
            tx,
        ));

        RepoDownload {
            progress: rx,
            handle,
        }
    }
}

async fn run_repo_download(
    source: Arc<dyn RemoteFileSource>,
    config: DownloadConfig,
    session_key: String,
    targets: Vec<DownloadTarget>,
    files: BTreeSet<String>,
    cancel: CancellationToken,
    tx: watch::Sender<RepoProgress>,
) -> DownloadResult<()> {
    let shared = Arc::new(SharedProgress::new());
    let semaphore = Arc::new(Semaphore::new(config.max_file_concurrency));
    let downloader = FileDownloader::new(config.clone());

    info!(
        session = %session_key,
        files = targets.len(),
        concurrency = config.max_file_concurrency,
        "starting repository download"
    );

    let mut tasks = JoinSet::new();
    for target in targets {
        tasks.spawn(download_one(
            Arc::clone(&source),
            config.clone(),
            downloader.clone(),
            session_key.clone(),
            target,
            Arc::clone(&shared),
            Arc::clone(&semaphore),
            cancel.clone(),
        ));
    }

    // Monitor loop: emit a snapshot every poll interval until every task
    // has settled.
    let mut poll = tokio::time::interval(config.poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = poll.tick() => {
                tx.send_replace(shared.snapshot(&files, false));
            }
            joined = tasks.join_next() => match joined {
                Some(Ok(())) => {}
                Some(Err(e)) => shared.record_error(DownloadError::TaskFailed(e.to_string())),
                None => break,
            },
        }
    }

    let first_error = shared.first_error.lock().take();
    if let Some(err) = first_error {
        tx.send_replace(shared.snapshot(&files, false));
        warn!(session = %session_key, error = %err, "repository download failed");
        return Err(err);
    }
    if cancel.is_cancelled() {
        tx.send_replace(shared.snapshot(&files, false));
        debug!(session = %session_key, "repository download cancelled");
        return Err(DownloadError::Cancelled);
    }

    tx.send_replace(shared.snapshot(&files, true));
    info!(session = %session_key, "repository download complete");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn download_one(
    source: Arc<dyn RemoteFileSource>,
    config: DownloadConfig,
    downloader: FileDownloader,
    session_key: String,
    target: DownloadTarget,
    shared: Arc<SharedProgress>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    // Queue for a permit; the semaphore is the sole admission control.
    let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };
    if cancel.is_cancelled() {
        return;
    }

    match transfer_target(
        source,
        &config,
        &downloader,
        &session_key,
        &target,
        &shared,
        &cancel,
    )
    .await
    {
        Ok(()) => {
            shared.per_file.remove(&target.name);
            shared.completed.lock().insert(target.name.clone());
        }
        Err(err) => {
            if err.is_auth() {
                // Fast-fail: abort the whole repository, even transfers
                // that are mid-flight.
                shared.record_error(err);
                cancel.cancel();
            } else {
                shared.record_error(err);
            }
        }
    }
}

/// Transfer one target: resume decision, marker bookkeeping, streaming,
/// completion verification, marker cleanup.
async fn transfer_target(
    source: Arc<dyn RemoteFileSource>,
    config: &DownloadConfig,
    downloader: &FileDownloader,
    session_key: &str,
    target: &DownloadTarget,
    shared: &Arc<SharedProgress>,
    cancel: &CancellationToken,
) -> DownloadResult<()> {
    // A file already matching its declared size needs no transfer at all,
    // marker or not; re-running a finished session is a no-op.
    if let Some(expected) = target.expected_size {
        if state::is_complete(&target.dest, expected) {
            debug!(name = %target.name, "already complete on disk, skipping");
            state::remove_marker(&target.dest);
            return Ok(());
        }
    }

    let start_offset = match state::resume_decision(&target.dest, session_key) {
        ResumeDecision::AlreadyComplete => {
            debug!(name = %target.name, "already complete on disk, skipping");
            state::remove_marker(&target.dest);
            return Ok(());
        }
        ResumeDecision::StartAt(offset) => offset,
    };

    // Declared total: hub listing first, HEAD request as fallback. The
    // marker's total is write-once, so an existing valid marker keeps its.
    let marker = match state::read_marker(&target.dest) {
        Ok(Some(m)) if m.session_key == session_key => m,
        _ => {
            let declared = match target.expected_size {
                Some(size) => size,
                None => source.head(&target.url).await.ok().flatten().unwrap_or(0),
            };
            let m = DownloadMarker::new(session_key, declared);
            state::write_marker(&target.dest, &m)?;
            m
        }
    };

    if start_offset > 0 {
        info!(
            name = %target.name,
            start_offset,
            declared = marker.total_size,
            "resuming file from on-disk offset"
        );
    }

    let dest = target.dest.clone();
    let marker_template = marker.clone();
    let shared_cb = Arc::clone(shared);
    let on_progress: FileProgressCallback = Arc::new(move |p: FileProgress| {
        // Diagnostic marker refresh; resume never trusts this field.
        let refreshed = DownloadMarker {
            bytes_downloaded: p.bytes_downloaded,
            ..marker_template.clone()
        };
        if let Err(e) = state::write_marker(&dest, &refreshed) {
            warn!(dest = %dest.display(), error = %e, "marker refresh failed");
        }
        shared_cb.per_file.insert(p.name.clone(), p);
    });

    let outcome = downloader
        .download(source.as_ref(), target, start_offset, on_progress, cancel)
        .await?;

    // Completion is an exact on-disk size match against the declared total
    // whenever one is known; the stream ending early is not completion.
    if marker.total_size > 0 && !state::is_complete(&target.dest, marker.total_size) {
        return Err(DownloadError::Transfer {
            url: target.url.clone(),
            reason: format!(
                "incomplete transfer: {} of {} bytes on disk",
                state::on_disk_size(&target.dest),
                marker.total_size
            ),
        });
    }
    if !outcome.completed {
        return Err(DownloadError::Transfer {
            url: target.url.clone(),
            reason: "stream ended before expected size".to_string(),
        });
    }

    if config.verify_checksums {
        if let Some(expected) = target.sha256.clone() {
            let path = target.dest.clone();
            tokio::task::spawn_blocking(move || verify_checksum(&path, &expected))
                .await
                .map_err(|e| DownloadError::TaskFailed(e.to_string()))??;
        }
    }

    state::remove_marker(&target.dest);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::source::tests::MockSource;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> DownloadConfig {
        let mut config = DownloadConfig::new(dir.path().to_path_buf());
        config.snapshot_interval = std::time::Duration::ZERO;
        config.poll_interval = std::time::Duration::from_millis(10);
        config
    }

    fn target(dir: &TempDir, name: &str) -> DownloadTarget {
        DownloadTarget {
            name: name.to_string(),
            url: format!("repo/{name}"),
            dest: dir.path().join(name),
            expected_size: None,
            sha256: None,
        }
    }

    fn mock_with(files: &[(&str, Vec<u8>)]) -> MockSource {
        let mut source = MockSource::new();
        for (name, data) in files {
            source = source.with_file(&format!("repo/{name}"), data.clone());
        }
        source
    }

    #[tokio::test]
    async fn test_download_all_success() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(mock_with(&[
            ("a.gguf", vec![1u8; 3000]),
            ("b.gguf", vec![2u8; 2000]),
            ("c.json", vec![3u8; 100]),
        ]));

        let orchestrator = RepoDownloader::new(source, config(&dir));
        let targets = vec![
            target(&dir, "a.gguf"),
            target(&dir, "b.gguf"),
            target(&dir, "c.json"),
        ];
        let download = orchestrator.download_all("m", targets, CancellationToken::new());
        let progress = download.progress();
        download.wait().await.unwrap();

        let snapshot = progress.borrow().clone();
        assert!(snapshot.completed);
        assert_eq!(snapshot.completed_files.len(), 3);
        assert!(snapshot.active.is_empty());
        assert!((snapshot.overall() - 1.0).abs() < f64::EPSILON);

        // Markers cleaned up on confirmed completion.
        for name in ["a.gguf", "b.gguf", "c.json"] {
            assert!(state::read_marker(&dir.path().join(name)).unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_auth_failure_aborts_repository() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(
            mock_with(&[("a.gguf", vec![1u8; 1000]), ("c.gguf", vec![3u8; 1000])])
                .with_status("repo/b.gguf", 401),
        );

        let orchestrator = RepoDownloader::new(source, config(&dir));
        let targets = vec![
            target(&dir, "a.gguf"),
            target(&dir, "b.gguf"),
            target(&dir, "c.gguf"),
        ];
        let download = orchestrator.download_all("m", targets, CancellationToken::new());
        let err = download.wait().await.unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn test_non_auth_failure_drains_then_reports() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(
            mock_with(&[("a.gguf", vec![1u8; 4000]), ("c.gguf", vec![3u8; 4000])])
                .with_status("repo/b.gguf", 503),
        );

        let orchestrator = RepoDownloader::new(source, config(&dir));
        let targets = vec![
            target(&dir, "a.gguf"),
            target(&dir, "b.gguf"),
            target(&dir, "c.gguf"),
        ];
        let download = orchestrator.download_all("m", targets, CancellationToken::new());
        let err = download.wait().await.unwrap_err();

        match err {
            DownloadError::HttpStatus { status, .. } => assert_eq!(status, 503),
            other => panic!("unexpected: {other}"),
        }
        // The healthy files still ran to completion.
        assert_eq!(std::fs::read(dir.path().join("a.gguf")).unwrap().len(), 4000);
        assert_eq!(std::fs::read(dir.path().join("c.gguf")).unwrap().len(), 4000);
    }

    #[tokio::test]
    async fn test_already_complete_file_is_skipped() {
        let dir = TempDir::new().unwrap();
        let data = vec![9u8; 2048];
        let source = Arc::new(mock_with(&[("a.gguf", data.clone())]));

        // Complete file plus its (not yet cleaned) marker.
        let dest = dir.path().join("a.gguf");
        std::fs::write(&dest, &data).unwrap();
        state::write_marker(&dest, &DownloadMarker::new("m", 2048)).unwrap();

        let orchestrator = RepoDownloader::new(source, config(&dir));
        let download =
            orchestrator.download_all("m", vec![target(&dir, "a.gguf")], CancellationToken::new());
        download.wait().await.unwrap();

        assert!(state::read_marker(&dest).unwrap().is_none());
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn test_resume_uses_on_disk_offset() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..6000u32).map(|i| (i % 13) as u8).collect();
        let source = Arc::new(mock_with(&[("a.gguf", data.clone())]));

        let dest = dir.path().join("a.gguf");
        std::fs::write(&dest, &data[..2500]).unwrap();
        state::write_marker(&dest, &DownloadMarker::new("m", 6000)).unwrap();

        let orchestrator = RepoDownloader::new(source, config(&dir));
        let download =
            orchestrator.download_all("m", vec![target(&dir, "a.gguf")], CancellationToken::new());
        download.wait().await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails_file() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(mock_with(&[("a.gguf", vec![1u8; 500])]));

        let mut bad = target(&dir, "a.gguf");
        bad.sha256 = Some("0000000000000000000000000000000000000000000000000000000000000000".into());

        let orchestrator = RepoDownloader::new(source, config(&dir));
        let download = orchestrator.download_all("m", vec![bad], CancellationToken::new());
        match download.wait().await.unwrap_err() {
            DownloadError::ChecksumMismatch { .. } => {}
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_leaves_partial_state() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(mock_with(&[("a.gguf", vec![1u8; 100_000])]));

        let cancel = CancellationToken::new();
        cancel.cancel();

        let orchestrator = RepoDownloader::new(source, config(&dir));
        let download = orchestrator.download_all("m", vec![target(&dir, "a.gguf")], cancel);
        let err = download.wait().await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_empty_repository_completes() {
        let dir = TempDir::new().unwrap();
        let source: Arc<MockSource> = Arc::new(MockSource::new());
        let orchestrator = RepoDownloader::new(source, config(&dir));
        let download = orchestrator.download_all("m", Vec::new(), CancellationToken::new());
        let progress = download.progress();
        download.wait().await.unwrap();
        assert!(progress.borrow().completed);
    }

    #[test]
    fn test_record_error_prefers_auth() {
        let shared = SharedProgress::new();
        shared.record_error(DownloadError::HttpStatus {
            url: "u".into(),
            status: 500,
        });
        shared.record_error(DownloadError::AuthenticationRequired {
            url: "u".into(),
            status: 401,
        });
        assert!(shared.first_error.lock().as_ref().unwrap().is_auth());
    }

    #[test]
    fn test_record_error_ignores_cancelled() {
        let shared = SharedProgress::new();
        shared.record_error(DownloadError::Cancelled);
        assert!(shared.first_error.lock().is_none());

        shared.record_error(DownloadError::Transfer {
            url: "u".into(),
            reason: "boom".into(),
        });
        shared.record_error(DownloadError::Transfer {
            url: "u2".into(),
            reason: "later".into(),
        });
        match shared.first_error.lock().as_ref().unwrap() {
            DownloadError::Transfer { url, .. } => assert_eq!(url, "u"),
            other => panic!("unexpected: {other}"),
        };
    }

    #[test]
    fn test_snapshot_invariant_disjoint_sets() {
        let shared = SharedProgress::new();
        let files: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        shared.completed.lock().insert("a".to_string());
        shared.per_file.insert(
            "b".to_string(),
            FileProgress {
                name: "b".to_string(),
                path: PathBuf::from("/b"),
                completed: false,
                bytes_downloaded: 10,
                total_bytes: Some(100),
                bytes_per_sec: 0.0,
            },
        );

        let snap = shared.snapshot(&files, false);
        for active in &snap.active {
            assert!(!snap.completed_files.contains(&active.name));
        }
        assert!(snap.completed_files.is_subset(&snap.files));
    }
}
