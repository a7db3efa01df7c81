//! Error types for the download subsystem.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for download operations.
pub type DownloadResult<T> = Result<T, DownloadError>;

/// Errors that can occur while downloading model artifacts.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The remote answered 401/403. Never retried; aborts the whole
    /// repository download immediately.
    #[error("authentication required for {url} (HTTP {status})")]
    AuthenticationRequired { url: String, status: u16 },

    /// Non-success HTTP status other than 401/403.
    #[error("transfer failed for {url}: HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    /// Network-level failure during a transfer (connect, read, protocol).
    #[error("transfer failed for {url}: {reason}")]
    Transfer { url: String, reason: String },

    /// Failed to create a directory on the way to the output path.
    #[error("failed to create directory {path}: {source}")]
    CreateDirFailed { path: PathBuf, source: io::Error },

    /// Failed to write or flush the output file.
    #[error("failed to write {path}: {source}")]
    WriteFailed { path: PathBuf, source: io::Error },

    /// Failed to read a local file (output file or marker).
    #[error("failed to read {path}: {source}")]
    ReadFailed { path: PathBuf, source: io::Error },

    /// A `start` or `resume` was issued for a key that already has an
    /// active session. Rejected synchronously, no side effects.
    #[error("a download session for '{key}' is already active")]
    SessionConflict { key: String },

    /// A marker file could not be parsed or contradicts the on-disk file.
    /// The marker is discarded and the file treated as not yet started.
    #[error("corrupt download marker {path}: {reason}")]
    StateCorruption { path: PathBuf, reason: String },

    /// Downloaded file does not match the expected SHA-256 digest.
    #[error("checksum mismatch for {filename}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        filename: String,
        expected: String,
        actual: String,
    },

    /// The hub API returned an unusable file listing.
    #[error("failed to list repository {repo}: {reason}")]
    ListingFailed { repo: String, reason: String },

    /// The operation was cancelled via its cancellation token.
    #[error("download cancelled")]
    Cancelled,

    /// A download task panicked or was aborted by the runtime.
    #[error("download task failed: {0}")]
    TaskFailed(String),
}

impl DownloadError {
    /// Whether this error is an authentication failure.
    ///
    /// Authentication failures are terminal for the whole repository
    /// download, not just the file that hit them.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthenticationRequired { .. })
    }

    /// Whether this error is a cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
