//! ModelFetch - resumable model artifact downloads
//!
//! This library fetches machine-learning model artifacts (GGUF files and
//! friends) from a model hub to local disk, with bounded concurrency,
//! byte-range resumption, crash-safe progress persistence, and
//! pause/resume/cancel session semantics.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use modelfetch::config::DownloadConfig;
//! use modelfetch::download::{DownloadManager, HttpFileSource};
//! use modelfetch::hub::HubClient;
//!
//! let config = DownloadConfig::default();
//! let hub = HubClient::new()?;
//! let source = Arc::new(HttpFileSource::new()?);
//! let manager = DownloadManager::new(source, config);
//!
//! let files = hub.list_files("Qwen/Qwen3-4B-GGUF").await?;
//! let targets = hub.targets(
//!     "Qwen/Qwen3-4B-GGUF",
//!     &files,
//!     &manager.session_dir("Qwen/Qwen3-4B-GGUF"),
//! );
//! manager.start("Qwen/Qwen3-4B-GGUF", targets)?;
//! ```

pub mod config;
pub mod download;
pub mod hub;
pub mod telemetry;

pub use config::DownloadConfig;
pub use download::{
    DownloadError, DownloadManager, DownloadResult, DownloadTarget, FileProgress, RepoProgress,
    SessionStatus,
};
