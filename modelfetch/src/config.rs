//! Configuration for the download engine.

use std::path::PathBuf;
use std::time::Duration;

/// Lower clamp for the adaptive write buffer (16 KiB).
///
/// Small files use small buffers so cancellation stays responsive.
pub const MIN_BUFFER_SIZE: usize = 16 * 1024;

/// Upper clamp for the adaptive write buffer (1 MiB).
///
/// Large files use large buffers for throughput, but never beyond this.
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Buffer size used when the total file size is unknown (64 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Configuration for the download engine.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Directory under which each session gets its own subdirectory.
    pub models_root: PathBuf,

    /// Maximum concurrent file transfers within one repository download.
    pub max_file_concurrency: usize,

    /// Maximum simultaneously running repository-level sessions.
    pub max_sessions: usize,

    /// Per-read timeout under the caller's cancellation signal. A read
    /// that only hits this timeout is retried; it is not a failure.
    pub read_timeout: Duration,

    /// How often the orchestrator's monitor loop emits a repository
    /// progress snapshot.
    pub poll_interval: Duration,

    /// Minimum interval between per-file progress snapshots.
    pub snapshot_interval: Duration,

    /// Flush the output file every N chunks (and always on completion or
    /// cancellation). Flushing every chunk kills throughput.
    pub flush_every_chunks: u32,

    /// Verify SHA-256 digests of completed files when the hub supplied one.
    pub verify_checksums: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            models_root: default_models_root(),
            max_file_concurrency: 4,
            max_sessions: 2,
            read_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_millis(200),
            snapshot_interval: Duration::from_millis(500),
            flush_every_chunks: 32,
            verify_checksums: true,
        }
    }
}

impl DownloadConfig {
    /// Create a configuration rooted at the given models directory.
    pub fn new(models_root: PathBuf) -> Self {
        Self {
            models_root,
            ..Default::default()
        }
    }

    /// Set the per-repository file concurrency.
    pub fn with_file_concurrency(mut self, max: usize) -> Self {
        self.max_file_concurrency = max.max(1);
        self
    }

    /// Set the system-wide session cap.
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max.max(1);
        self
    }

    /// Set the per-read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the monitor poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Enable or disable checksum verification.
    pub fn with_verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }
}

/// Default models root: `~/.cache/modelfetch/models`, falling back to a
/// temp directory when no home directory exists.
pub fn default_models_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("modelfetch")
        .join("models")
}

/// Pick a write-buffer size for a file of the given expected size.
///
/// Roughly 1/256th of the file, clamped to `[MIN_BUFFER_SIZE,
/// MAX_BUFFER_SIZE]`; unknown sizes get [`DEFAULT_BUFFER_SIZE`].
pub fn buffer_size_for(total_bytes: Option<u64>) -> usize {
    match total_bytes {
        Some(total) => {
            let scaled = (total / 256).min(MAX_BUFFER_SIZE as u64) as usize;
            scaled.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE)
        }
        None => DEFAULT_BUFFER_SIZE,
    }
}

/// Format a byte count as a human-readable size.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Format a transfer speed as a human-readable rate.
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_size(bytes_per_sec.max(0.0) as u64))
}
