//! CLI command handlers.

pub mod cancel;
pub mod get;
pub mod list;
pub mod status;

use modelfetch::{RepoProgress, SessionStatus};

/// Human label for a session status.
pub fn status_label(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Downloading => "downloading",
        SessionStatus::Paused => "paused",
        SessionStatus::Completed => "completed",
        SessionStatus::Failed => "failed",
        SessionStatus::NotFound => "not found",
    }
}

/// One-line progress summary, e.g. `3/5 files, 42.0%`.
pub fn progress_summary(progress: &RepoProgress) -> String {
    format!(
        "{}/{} files, {:.1}%",
        progress.completed_files.len(),
        progress.files.len(),
        progress.overall() * 100.0
    )
}
