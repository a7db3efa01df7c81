//! Model hub file listing.
//!
//! Turns a repository id (e.g. `Qwen/Qwen3-4B-GGUF`) into the set of
//! [`DownloadTarget`]s the download engine consumes, via the hub's tree
//! API (`/api/models/{repo}/tree/main[/path]`, one request per directory
//! level). LFS-backed entries carry a SHA-256 digest, which flows into the
//! targets for post-download verification.
//!
//! Everything else about the hub (search, cards, metadata) is out of scope;
//! this module only resolves listings and download URLs.

use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::download::{DownloadError, DownloadResult, DownloadTarget};

/// Default hub endpoint.
pub const DEFAULT_BASE_URL: &str = "https://huggingface.co";

/// One file in a hub repository listing.
#[derive(Debug, Clone)]
pub struct HubFile {
    /// Path within the repository (may contain directories).
    pub path: String,
    /// Size in bytes, when the listing reports one.
    pub size: Option<u64>,
    /// SHA-256 digest (lowercase hex) for LFS-backed files.
    pub sha256: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TreeItem {
    #[serde(rename = "type")]
    item_type: String,
    path: String,
    size: Option<u64>,
    lfs: Option<LfsInfo>,
}

#[derive(Debug, Deserialize)]
struct LfsInfo {
    oid: String,
}

/// Client for the hub's listing API.
pub struct HubClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HubClient {
    /// Create a client against the default hub, picking up any ambient
    /// token (`HF_TOKEN` or the hub CLI's token file).
    pub fn new() -> DownloadResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(20))
            .user_agent(concat!("modelfetch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DownloadError::Transfer {
                url: DEFAULT_BASE_URL.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            token: discover_token(),
        })
    }

    /// Point the client at a different hub endpoint (e.g. a mirror).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Use an explicit bearer token instead of the ambient one.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// The token this client sends, if any.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// List every file in a repository, descending into nested directories.
    pub async fn list_files(&self, repo_id: &str) -> DownloadResult<Vec<HubFile>> {
        let mut files = Vec::new();
        let mut pending: Vec<String> = vec![String::new()];

        while let Some(prefix) = pending.pop() {
            let url = if prefix.is_empty() {
                format!("{}/api/models/{}/tree/main", self.base_url, repo_id)
            } else {
                format!("{}/api/models/{}/tree/main/{}", self.base_url, repo_id, prefix)
            };
            debug!(repo = repo_id, %url, "listing repository tree");

            let mut request = self.client.get(&url);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            let response = request.send().await.map_err(|e| DownloadError::ListingFailed {
                repo: repo_id.to_string(),
                reason: e.to_string(),
            })?;

            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(DownloadError::AuthenticationRequired {
                    url,
                    status: status.as_u16(),
                });
            }
            if !status.is_success() {
                return Err(DownloadError::ListingFailed {
                    repo: repo_id.to_string(),
                    reason: format!("HTTP {status}"),
                });
            }

            let items: Vec<TreeItem> =
                response.json().await.map_err(|e| DownloadError::ListingFailed {
                    repo: repo_id.to_string(),
                    reason: e.to_string(),
                })?;

            for item in items {
                match item.item_type.as_str() {
                    "file" => files.push(HubFile {
                        path: item.path,
                        size: item.size,
                        sha256: item.lfs.map(|l| l.oid),
                    }),
                    "directory" => pending.push(item.path),
                    _ => {}
                }
            }
        }

        Ok(files)
    }

    /// Download URL for one file in a repository.
    pub fn resolve_url(&self, repo_id: &str, path: &str) -> String {
        format!("{}/{}/resolve/main/{}", self.base_url, repo_id, path)
    }

    /// Build download targets for a listing, rooted at `session_dir`.
    pub fn targets(
        &self,
        repo_id: &str,
        files: &[HubFile],
        session_dir: &Path,
    ) -> Vec<DownloadTarget> {
        files
            .iter()
            .map(|file| DownloadTarget {
                name: file.path.clone(),
                url: self.resolve_url(repo_id, &file.path),
                dest: session_dir.join(&file.path),
                expected_size: file.size,
                sha256: file.sha256.clone(),
            })
            .collect()
    }
}

/// Ambient hub token: the `HF_TOKEN` environment variable, falling back to
/// the hub CLI's token file.
pub fn discover_token() -> Option<String> {
    if let Ok(token) = std::env::var("HF_TOKEN") {
        let token = token.trim().to_string();
        if !token.is_empty() {
            return Some(token);
        }
    }
    let path = dirs::home_dir()?.join(".cache/huggingface/token");
    std::fs::read_to_string(path)
        .ok()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}
