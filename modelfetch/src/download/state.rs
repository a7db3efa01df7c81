//! Crash-safe download state persistence.
//!
//! One JSON sidecar marker is written next to each output file when its
//! transfer begins (`model.gguf` → `model.gguf.download`). The marker holds
//! the declared total size and start time; the ground truth for "how much is
//! downloaded" is always the actual byte length of the output file on disk.
//! The marker's `bytes_downloaded` field is diagnostic display only and is
//! never trusted for resume or completion decisions.
//!
//! Completion is an exact size match: `on-disk size == declared size`. This
//! tolerates a crash between the last marker write and the last disk flush:
//! on restart, the file length says exactly where to resume.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::{DownloadError, DownloadResult};

/// Extension appended to the output file name to form the marker name.
pub const MARKER_SUFFIX: &str = "download";

/// Durable sidecar record for one in-progress target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadMarker {
    /// Session key this target belongs to.
    pub session_key: String,
    /// Declared total size of the file. Write-once per file.
    pub total_size: u64,
    /// When the transfer first started.
    pub started_at: DateTime<Utc>,
    /// Last observed downloaded byte count. Diagnostic only; resume and
    /// completion always re-derive from the real file size.
    #[serde(default)]
    pub bytes_downloaded: u64,
}

impl DownloadMarker {
    /// Create a marker for a transfer starting now.
    pub fn new(session_key: impl Into<String>, total_size: u64) -> Self {
        Self {
            session_key: session_key.into(),
            total_size,
            started_at: Utc::now(),
            bytes_downloaded: 0,
        }
    }
}

/// Path of the marker sidecar for an output file.
pub fn marker_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push('.');
    name.push_str(MARKER_SUFFIX);
    dest.with_file_name(name)
}

/// Write (or replace) the marker for an output file.
pub fn write_marker(dest: &Path, marker: &DownloadMarker) -> DownloadResult<()> {
    let path = marker_path(dest);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| DownloadError::CreateDirFailed {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    let json = serde_json::to_vec_pretty(marker).map_err(|e| DownloadError::StateCorruption {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    fs::write(&path, json).map_err(|e| DownloadError::WriteFailed { path, source: e })
}

/// Read the marker for an output file, if one exists.
///
/// An unparseable marker is a [`DownloadError::StateCorruption`]; callers
/// handle it by discarding the marker, never by failing the session.
pub fn read_marker(dest: &Path) -> DownloadResult<Option<DownloadMarker>> {
    let path = marker_path(dest);
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(DownloadError::ReadFailed { path, source: e }),
    };
    let marker = serde_json::from_slice(&raw).map_err(|e| DownloadError::StateCorruption {
        path,
        reason: e.to_string(),
    })?;
    Ok(Some(marker))
}

/// Delete the marker for an output file. Missing markers are fine.
pub fn remove_marker(dest: &Path) {
    let path = marker_path(dest);
    match fs::remove_file(&path) {
        Ok(()) => debug!(marker = %path.display(), "removed download marker"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(marker = %path.display(), error = %e, "failed to remove marker"),
    }
}

/// Current byte length of the output file on disk (0 if absent).
pub fn on_disk_size(dest: &Path) -> u64 {
    fs::metadata(dest).map(|m| m.len()).unwrap_or(0)
}

/// Whether a target is complete: on-disk size exactly equals the declared
/// total. Idempotent; calling it on an already-complete file stays `true`.
pub fn is_complete(dest: &Path, declared_size: u64) -> bool {
    declared_size > 0 && on_disk_size(dest) == declared_size
}

/// Resume decision for one target, derived purely from disk state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeDecision {
    /// File already matches its declared size; nothing to transfer.
    AlreadyComplete,
    /// Start the transfer at this byte offset (0 = from scratch).
    StartAt(u64),
}

/// Decide where a target's transfer should start.
///
/// Reads the marker and the real file length. A marker that cannot be
/// parsed, or whose declared size is exceeded by the actual file, is stale:
/// it is discarded and the file restarts from zero.
pub fn resume_decision(dest: &Path, session_key: &str) -> ResumeDecision {
    let actual = on_disk_size(dest);

    let marker = match read_marker(dest) {
        Ok(marker) => marker,
        Err(e) => {
            warn!(dest = %dest.display(), error = %e, "discarding unreadable marker");
            remove_marker(dest);
            return ResumeDecision::StartAt(0);
        }
    };

    match marker {
        Some(marker) => {
            if marker.session_key != session_key {
                warn!(
                    dest = %dest.display(),
                    marker_key = %marker.session_key,
                    "marker belongs to a different session, restarting"
                );
                remove_marker(dest);
                return ResumeDecision::StartAt(0);
            }
            if actual > marker.total_size {
                // The file outgrew its declared size: the marker cannot be
                // trusted as a resume point.
                warn!(
                    dest = %dest.display(),
                    actual,
                    declared = marker.total_size,
                    "on-disk file exceeds declared size, restarting"
                );
                remove_marker(dest);
                return ResumeDecision::StartAt(0);
            }
            if actual == marker.total_size && marker.total_size > 0 {
                ResumeDecision::AlreadyComplete
            } else {
                ResumeDecision::StartAt(actual)
            }
        }
        // No marker: an existing file without one is from some earlier,
        // unfinished bookkeeping; restart to be safe.
        None => ResumeDecision::StartAt(0),
    }
}

/// A target recovered from disk inspection (no in-memory session).
#[derive(Debug, Clone)]
pub struct RecoveredTarget {
    /// Output file path the marker sits next to.
    pub dest: PathBuf,
    /// The persisted marker.
    pub marker: DownloadMarker,
    /// Current on-disk length of the output file.
    pub on_disk: u64,
}

impl RecoveredTarget {
    /// Whether this target finished (exact size match).
    pub fn is_complete(&self) -> bool {
        is_complete(&self.dest, self.marker.total_size)
    }
}

/// Scan a session directory for download markers, recursively.
///
/// Unparseable markers are skipped with a warning; they will be discarded
/// the next time the target is started.
pub fn scan_session_dir(dir: &Path) -> Vec<RecoveredTarget> {
    let mut recovered = Vec::new();
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let is_marker = path
                .extension()
                .map(|e| e == MARKER_SUFFIX)
                .unwrap_or(false);
            if !is_marker {
                continue;
            }
            let dest = path.with_extension("");
            match read_marker(&dest) {
                Ok(Some(marker)) => {
                    let on_disk = on_disk_size(&dest);
                    recovered.push(RecoveredTarget {
                        dest,
                        marker,
                        on_disk,
                    });
                }
                Ok(None) => {}
                Err(e) => warn!(marker = %path.display(), error = %e, "skipping corrupt marker"),
            }
        }
    }

    recovered
}
