//! Immutable progress snapshots for file and repository downloads.
//!
//! Progress flows up the stack as values, never as shared mutable state:
//! each update produces a fresh snapshot, so readers (the orchestrator's
//! monitor loop, the CLI, status queries) can never observe a torn update.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Point-in-time progress of a single file transfer.
#[derive(Debug, Clone)]
pub struct FileProgress {
    /// File name within the repository (e.g. `model-00001.gguf`).
    pub name: String,
    /// Local output path.
    pub path: PathBuf,
    /// Whether the transfer has finished.
    pub completed: bool,
    /// Bytes written so far, including any resumed prefix.
    pub bytes_downloaded: u64,
    /// Expected total size. `None` until headers arrive, or if the remote
    /// never sent a `Content-Length`.
    pub total_bytes: Option<u64>,
    /// Instantaneous transfer speed from a sliding window of recent chunks.
    pub bytes_per_sec: f64,
}

impl FileProgress {
    /// Fractional progress in `[0.0, 1.0]`, or `None` when the total size
    /// is unknown.
    pub fn fraction(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => {
                Some((self.bytes_downloaded as f64 / total as f64).min(1.0))
            }
            Some(_) => Some(1.0),
            None => None,
        }
    }

    /// Estimated remaining time, or `None` when the total size is unknown
    /// or the transfer is currently stalled.
    pub fn eta(&self) -> Option<Duration> {
        let total = self.total_bytes?;
        if self.bytes_per_sec <= 0.0 {
            return None;
        }
        let remaining = total.saturating_sub(self.bytes_downloaded);
        Some(Duration::from_secs_f64(remaining as f64 / self.bytes_per_sec))
    }
}

/// Point-in-time progress of a whole repository download.
///
/// Invariant: `completed ∪ active-names ⊆ files`, and a file appears in at
/// most one of the two at a time.
#[derive(Debug, Clone, Default)]
pub struct RepoProgress {
    /// Names of every file in the repository download.
    pub files: BTreeSet<String>,
    /// Names of files that have finished.
    pub completed_files: BTreeSet<String>,
    /// Per-file progress for in-flight transfers.
    pub active: Vec<FileProgress>,
    /// Whether the whole repository download has finished.
    pub completed: bool,
}

impl RepoProgress {
    /// Overall fractional progress across the repository.
    ///
    /// Completed files count as 1.0 each; in-flight files contribute their
    /// own fraction (0.0 while their total is still unknown).
    pub fn overall(&self) -> f64 {
        if self.files.is_empty() {
            return if self.completed { 1.0 } else { 0.0 };
        }
        let in_flight: f64 = self
            .active
            .iter()
            .map(|p| p.fraction().unwrap_or(0.0))
            .sum();
        (self.completed_files.len() as f64 + in_flight) / self.files.len() as f64
    }

    /// Total bytes downloaded across in-flight files.
    ///
    /// Completed files are not re-stat'ed here; this is a display aid for
    /// the current transfer wave, not an accounting value.
    pub fn active_bytes(&self) -> u64 {
        self.active.iter().map(|p| p.bytes_downloaded).sum()
    }

    /// Aggregate transfer speed across in-flight files.
    pub fn bytes_per_sec(&self) -> f64 {
        self.active.iter().map(|p| p.bytes_per_sec).sum()
    }
}

/// Default number of recent chunks used for speed estimation.
pub const SPEED_WINDOW_CHUNKS: usize = 64;

/// Rolling speed estimate over the last K chunks.
///
/// Each recorded chunk keeps its byte count and arrival time; speed is the
/// windowed byte sum over the windowed wall-clock span. Old entries fall off
/// the back, so a stalled transfer decays toward zero instead of reporting
/// its lifetime average.
#[derive(Debug)]
pub struct SpeedTracker {
    window: std::collections::VecDeque<(Instant, u64)>,
    capacity: usize,
}

impl SpeedTracker {
    /// Create a tracker over the last `capacity` chunks.
    pub fn new(capacity: usize) -> Self {
        Self {
            window: std::collections::VecDeque::with_capacity(capacity),
            capacity: capacity.max(2),
        }
    }

    /// Record a chunk arrival.
    pub fn record(&mut self, bytes: u64) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back((Instant::now(), bytes));
    }

    /// Current estimate in bytes per second.
    ///
    /// Returns 0.0 until at least two chunks have been recorded.
    pub fn bytes_per_sec(&self) -> f64 {
        let (first, _) = match self.window.front() {
            Some(f) => *f,
            None => return 0.0,
        };
        if self.window.len() < 2 {
            return 0.0;
        }
        let span = first.elapsed().as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        // The first entry marks the window start; its bytes predate it.
        let bytes: u64 = self.window.iter().skip(1).map(|(_, b)| *b).sum();
        bytes as f64 / span
    }
}
