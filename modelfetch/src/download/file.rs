//! Single-file streaming downloader with resume support.
//!
//! Streams one remote file to one local path:
//! - `Range: bytes=N-` resume from a caller-supplied start offset
//! - adaptive write buffering (small files flush fast, large files favor
//!   throughput, both inside fixed clamps)
//! - rolling speed estimate over the last K chunks
//! - time-throttled progress snapshots
//! - layered cancellation: a short per-read timeout keeps a stalled socket
//!   from pinning the task, while the caller's token unwinds the whole
//!   transfer with a best-effort final flush
//!
//! On cancellation the partial file is left on disk intentionally; its
//! length is the resume point for the next attempt.

use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::error::{DownloadError, DownloadResult};
use super::progress::{FileProgress, SpeedTracker, SPEED_WINDOW_CHUNKS};
use super::source::{DownloadTarget, RemoteFileSource};
use crate::config::{buffer_size_for, DownloadConfig};

/// Callback invoked with throttled per-file progress snapshots.
pub type FileProgressCallback = Arc<dyn Fn(FileProgress) + Send + Sync>;

/// Final result of one file transfer.
#[derive(Debug, Clone)]
pub struct FileOutcome {
    /// Total bytes on disk after the transfer (including resumed prefix).
    pub bytes_downloaded: u64,
    /// Total size, if the remote or the hub listing reported one.
    pub total_bytes: Option<u64>,
    /// Whether the transfer ran to the end of the stream.
    pub completed: bool,
}

/// Streams single remote files to local paths.
#[derive(Clone)]
pub struct FileDownloader {
    config: DownloadConfig,
}

impl FileDownloader {
    /// Create a downloader with the given configuration.
    pub fn new(config: DownloadConfig) -> Self {
        Self { config }
    }

    /// Download `target` starting at `start_offset`, streaming to
    /// `target.dest`.
    ///
    /// Resuming (`start_offset > 0`) opens the output in append mode; a
    /// fresh download truncates. Missing parent directories are created.
    ///
    /// # Errors
    ///
    /// 401/403 surfaces as [`DownloadError::AuthenticationRequired`] and is
    /// never retried here. A read that only hits the per-read timeout is
    /// retried transparently; every other failure is terminal for this file.
    pub async fn download(
        &self,
        source: &dyn RemoteFileSource,
        target: &DownloadTarget,
        start_offset: u64,
        on_progress: FileProgressCallback,
        cancel: &CancellationToken,
    ) -> DownloadResult<FileOutcome> {
        let response = source.get(&target.url, start_offset).await?;

        // Content-Length covers the remaining range only; the whole-file
        // total adds back the resumed prefix.
        let total_bytes = response
            .content_length
            .map(|len| len + start_offset)
            .or(target.expected_size);

        if let Some(parent) = target.dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                DownloadError::CreateDirFailed {
                    path: parent.to_path_buf(),
                    source: e,
                }
            })?;
        }

        let file = if start_offset > 0 {
            OpenOptions::new().append(true).open(&target.dest).await
        } else {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&target.dest)
                .await
        }
        .map_err(|e| DownloadError::WriteFailed {
            path: target.dest.clone(),
            source: e,
        })?;

        let mut writer = BufWriter::with_capacity(buffer_size_for(total_bytes), file);
        let mut stream = response.stream;
        let mut downloaded = start_offset;
        let mut speed = SpeedTracker::new(SPEED_WINDOW_CHUNKS);
        let mut chunks_since_flush: u32 = 0;
        let mut last_snapshot = Instant::now();

        debug!(
            name = %target.name,
            start_offset,
            total = ?total_bytes,
            "starting file transfer"
        );

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Keep what we have; the partial file is the resume point.
                    let _ = writer.flush().await;
                    debug!(name = %target.name, downloaded, "transfer cancelled");
                    return Err(DownloadError::Cancelled);
                }
                read = tokio::time::timeout(self.config.read_timeout, stream.next()) => read,
            };

            let chunk = match read {
                // Per-read timeout with the outer signal still clear:
                // the socket is stalled, retry the read.
                Err(_) => {
                    trace!(name = %target.name, "read timed out, retrying");
                    continue;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    let _ = writer.flush().await;
                    return Err(e);
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            writer
                .write_all(&chunk)
                .await
                .map_err(|e| DownloadError::WriteFailed {
                    path: target.dest.clone(),
                    source: e,
                })?;

            downloaded += chunk.len() as u64;
            speed.record(chunk.len() as u64);

            chunks_since_flush += 1;
            if chunks_since_flush >= self.config.flush_every_chunks {
                writer
                    .flush()
                    .await
                    .map_err(|e| DownloadError::WriteFailed {
                        path: target.dest.clone(),
                        source: e,
                    })?;
                chunks_since_flush = 0;
            }

            if last_snapshot.elapsed() >= self.config.snapshot_interval {
                on_progress(FileProgress {
                    name: target.name.clone(),
                    path: target.dest.clone(),
                    completed: false,
                    bytes_downloaded: downloaded,
                    total_bytes,
                    bytes_per_sec: speed.bytes_per_sec(),
                });
                last_snapshot = Instant::now();
            }
        }

        writer
            .flush()
            .await
            .map_err(|e| DownloadError::WriteFailed {
                path: target.dest.clone(),
                source: e,
            })?;

        let completed = total_bytes.map_or(true, |t| downloaded >= t);
        on_progress(FileProgress {
            name: target.name.clone(),
            path: target.dest.clone(),
            completed,
            bytes_downloaded: downloaded,
            total_bytes,
            bytes_per_sec: speed.bytes_per_sec(),
        });

        debug!(name = %target.name, downloaded, completed, "file transfer finished");

        Ok(FileOutcome {
            bytes_downloaded: downloaded,
            total_bytes,
            completed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::source::tests::MockSource;
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn target(dir: &TempDir, name: &str, url: &str) -> DownloadTarget {
        DownloadTarget {
            name: name.to_string(),
            url: url.to_string(),
            dest: dir.path().join(name),
            expected_size: None,
            sha256: None,
        }
    }

    fn noop_progress() -> FileProgressCallback {
        Arc::new(|_| {})
    }

    fn collecting_progress() -> (FileProgressCallback, Arc<Mutex<Vec<FileProgress>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (Arc::new(move |p| sink.lock().push(p)), seen)
    }

    fn downloader() -> FileDownloader {
        let mut config = DownloadConfig::new(PathBuf::from("/tmp"));
        // Emit every snapshot in tests.
        config.snapshot_interval = std::time::Duration::ZERO;
        FileDownloader::new(config)
    }

    #[tokio::test]
    async fn test_download_writes_full_file() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let source = MockSource::new().with_file("u", data.clone());
        let target = target(&dir, "model.gguf", "u");

        let outcome = downloader()
            .download(&source, &target, 0, noop_progress(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.completed);
        assert_eq!(outcome.bytes_downloaded, data.len() as u64);
        assert_eq!(std::fs::read(&target.dest).unwrap(), data);
    }

    #[tokio::test]
    async fn test_resume_appends_from_offset() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..5_000u32).map(|i| (i % 17) as u8).collect();
        let source = MockSource::new().with_file("u", data.clone());
        let target = target(&dir, "model.gguf", "u");

        // First 2000 bytes already on disk from an interrupted attempt.
        std::fs::write(&target.dest, &data[..2000]).unwrap();

        let outcome = downloader()
            .download(&source, &target, 2000, noop_progress(), &CancellationToken::new())
            .await
            .unwrap();

        // Byte-identical to a clean single-pass download.
        assert_eq!(outcome.bytes_downloaded, data.len() as u64);
        assert_eq!(outcome.total_bytes, Some(data.len() as u64));
        assert_eq!(std::fs::read(&target.dest).unwrap(), data);
    }

    #[tokio::test]
    async fn test_total_includes_resumed_prefix() {
        let dir = TempDir::new().unwrap();
        let data = vec![7u8; 1000];
        let source = MockSource::new().with_file("u", data.clone());
        let target = target(&dir, "model.gguf", "u");
        std::fs::write(&target.dest, &data[..400]).unwrap();

        let (progress, seen) = collecting_progress();
        downloader()
            .download(&source, &target, 400, progress, &CancellationToken::new())
            .await
            .unwrap();

        // The mock serves 600 remaining bytes; total must read 1000.
        let last = seen.lock().last().unwrap().clone();
        assert_eq!(last.total_bytes, Some(1000));
        assert_eq!(last.bytes_downloaded, 1000);
        assert!(last.completed);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_keeps_no_partial_write() {
        let dir = TempDir::new().unwrap();
        let source = MockSource::new().with_file("u", vec![1u8; 4096]);
        let target = target(&dir, "model.gguf", "u");

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = downloader()
            .download(&source, &target, 0, noop_progress(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_auth_failure_propagates() {
        let dir = TempDir::new().unwrap();
        let source = MockSource::new().with_status("u", 403);
        let target = target(&dir, "model.gguf", "u");

        let err = downloader()
            .download(&source, &target, 0, noop_progress(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_auth());
        assert!(!target.dest.exists(), "no output file for a failed GET");
    }

    #[tokio::test]
    async fn test_creates_missing_directories() {
        let dir = TempDir::new().unwrap();
        let source = MockSource::new().with_file("u", vec![9u8; 128]);
        let mut target = target(&dir, "model.gguf", "u");
        target.dest = dir.path().join("a").join("b").join("model.gguf");

        downloader()
            .download(&source, &target, 0, noop_progress(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&target.dest).unwrap().len(), 128);
    }

    /// Source whose stream sits silent for a while before yielding its
    /// one chunk, like a stalled socket that comes back.
    struct StallingSource {
        data: bytes::Bytes,
        stall: std::time::Duration,
        gets: std::sync::atomic::AtomicUsize,
    }

    impl RemoteFileSource for StallingSource {
        fn head(
            &self,
            _url: &str,
        ) -> crate::download::source::BoxFuture<'_, DownloadResult<Option<u64>>> {
            let len = self.data.len() as u64;
            Box::pin(async move { Ok(Some(len)) })
        }

        fn get(
            &self,
            _url: &str,
            _start_offset: u64,
        ) -> crate::download::source::BoxFuture<
            '_,
            DownloadResult<crate::download::source::RemoteResponse>,
        > {
            self.gets
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let data = self.data.clone();
            let stall = self.stall;
            let stream = futures::stream::once(async move {
                tokio::time::sleep(stall).await;
                Ok::<bytes::Bytes, DownloadError>(data)
            });
            let content_length = self.data.len() as u64;
            Box::pin(async move {
                Ok(crate::download::source::RemoteResponse {
                    content_length: Some(content_length),
                    stream: Box::pin(stream),
                })
            })
        }
    }

    #[tokio::test]
    async fn test_stalled_read_retries_without_failing() {
        let dir = TempDir::new().unwrap();
        let data = bytes::Bytes::from(vec![5u8; 2048]);
        let source = StallingSource {
            data: data.clone(),
            stall: std::time::Duration::from_millis(150),
            gets: std::sync::atomic::AtomicUsize::new(0),
        };
        let target = target(&dir, "model.gguf", "u");

        let mut config = DownloadConfig::new(PathBuf::from("/tmp"));
        config.snapshot_interval = std::time::Duration::ZERO;
        // Several read timeouts elapse before the chunk arrives.
        config.read_timeout = std::time::Duration::from_millis(50);

        let outcome = FileDownloader::new(config)
            .download(&source, &target, 0, noop_progress(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.completed);
        assert_eq!(outcome.bytes_downloaded, 2048);
        assert_eq!(std::fs::read(&target.dest).unwrap(), data.to_vec());
        // The stalled reads were retried on the same response stream, not
        // by reissuing the request.
        assert_eq!(source.gets.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_progress_snapshots_are_monotonic() {
        let dir = TempDir::new().unwrap();
        let source = MockSource::new().with_file("u", vec![3u8; 16 * 1024]);
        let target = target(&dir, "model.gguf", "u");

        let (progress, seen) = collecting_progress();
        downloader()
            .download(&source, &target, 0, progress, &CancellationToken::new())
            .await
            .unwrap();

        let snapshots = seen.lock();
        assert!(!snapshots.is_empty());
        for pair in snapshots.windows(2) {
            assert!(pair[0].bytes_downloaded <= pair[1].bytes_downloaded);
        }
        assert!(snapshots.last().unwrap().completed);
    }
}
