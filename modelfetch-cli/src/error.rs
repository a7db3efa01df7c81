//! CLI error type.

use modelfetch::DownloadError;
use thiserror::Error;

/// Errors surfaced to the terminal.
#[derive(Debug, Error)]
pub enum CliError {
    /// Bad or missing argument / configuration.
    #[error("{0}")]
    Config(String),

    /// A download operation failed.
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// A download session ended in failure.
    #[error("download failed: {0}")]
    Session(String),
}
