//! Resumable, concurrent download engine for model artifacts.
//!
//! This module is the heart of the crate: it fetches large (multi-gigabyte)
//! files over HTTP with bounded concurrency, byte-range resumption after
//! interruption, crash-safe progress persistence, and pause/resume/cancel
//! session semantics.
//!
//! # Architecture
//!
//! ```text
//! DownloadManager (sessions, one active per key)
//!         │
//!         └── RepoDownloader (semaphore-bounded worker pool)
//!                 │
//!                 ├── N × FileDownloader (streaming, resume, throttled progress)
//!                 │         │
//!                 │         └── RemoteFileSource (trait; HTTP impl)
//!                 │
//!                 └── state (marker sidecars, crash recovery)
//! ```
//!
//! Progress flows back up the same chain as immutable [`FileProgress`] /
//! [`RepoProgress`] snapshots. Resume and completion decisions always come
//! from actual on-disk file sizes, never from persisted counters; the
//! `.download` markers only supply each file's declared total and start
//! time.

mod checksum;
mod error;
mod file;
mod progress;
mod repo;
mod session;
pub mod source;
pub mod state;

pub use checksum::{calculate_file_checksum, verify_checksum};
pub use error::{DownloadError, DownloadResult};
pub use file::{FileDownloader, FileOutcome, FileProgressCallback};
pub use progress::{FileProgress, RepoProgress, SpeedTracker};
pub use repo::{RepoDownload, RepoDownloader};
pub use session::{sanitize_key, DownloadInfo, DownloadManager, SessionStatus};
pub use source::{ByteStream, DownloadTarget, HttpFileSource, RemoteFileSource, RemoteResponse};
pub use state::{DownloadMarker, RecoveredTarget, ResumeDecision};
