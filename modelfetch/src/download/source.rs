//! Remote file source abstraction for testability.
//!
//! The download engine never talks to `reqwest` directly; it consumes the
//! [`RemoteFileSource`] trait. This keeps the transfer logic testable with
//! in-memory sources and leaves the wire details (auth headers, TLS, hub
//! URL shapes) in one place.
//!
//! The trait is dyn-compatible: async methods return [`BoxFuture`] rather
//! than using `async fn`, so the engine can hold an `Arc<dyn
//! RemoteFileSource>`.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use futures_util::TryStreamExt;

use super::error::{DownloadError, DownloadResult};

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Boxed stream of response body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = DownloadResult<Bytes>> + Send>>;

/// One remote file to fetch to one local path.
///
/// Immutable once a download starts.
#[derive(Debug, Clone)]
pub struct DownloadTarget {
    /// File name within the repository (e.g. `model-00001-of-00002.gguf`).
    pub name: String,
    /// Fully resolved download URL.
    pub url: String,
    /// Local output path.
    pub dest: PathBuf,
    /// Expected size from the hub listing, if known.
    pub expected_size: Option<u64>,
    /// Expected SHA-256 digest (lowercase hex), if the hub supplies one.
    pub sha256: Option<String>,
}

/// Response to a ranged GET: the remaining content length (not including
/// the skipped prefix) and the body stream.
pub struct RemoteResponse {
    /// `Content-Length` of the response body, if the remote sent one.
    pub content_length: Option<u64>,
    /// Body chunks in stream order.
    pub stream: ByteStream,
}

impl std::fmt::Debug for RemoteResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteResponse")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Abstract source of remote files.
///
/// `get` with `start_offset > 0` must issue a `Range: bytes=N-` request and
/// stream only the remaining bytes. Implementations must surface HTTP
/// 401/403 as [`DownloadError::AuthenticationRequired`] so the orchestrator
/// can abort the whole repository download instead of retrying.
pub trait RemoteFileSource: Send + Sync + 'static {
    /// Total size of the remote file, if the remote reports one.
    fn head(&self, url: &str) -> BoxFuture<'_, DownloadResult<Option<u64>>>;

    /// Open the remote file for reading, starting at `start_offset`.
    fn get(&self, url: &str, start_offset: u64) -> BoxFuture<'_, DownloadResult<RemoteResponse>>;
}

/// Default connect timeout for the HTTP source.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// HTTP implementation of [`RemoteFileSource`] over async `reqwest`.
///
/// No overall request timeout is set: multi-gigabyte transfers legitimately
/// run for hours. Stall detection is the downloader's job (per-read
/// timeout), not the client's.
pub struct HttpFileSource {
    client: reqwest::Client,
    bearer_token: Option<String>,
}

impl HttpFileSource {
    /// Create a new HTTP source with default settings.
    pub fn new() -> DownloadResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("modelfetch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DownloadError::Transfer {
                url: String::new(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            bearer_token: None,
        })
    }

    /// Attach a bearer token sent with every request (hub auth).
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.get(url);
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }
        req
    }

    fn check_status(url: &str, status: reqwest::StatusCode) -> DownloadResult<()> {
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(DownloadError::AuthenticationRequired {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        // 206 Partial Content is the expected answer to a Range request.
        if !status.is_success() {
            return Err(DownloadError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

impl RemoteFileSource for HttpFileSource {
    fn head(&self, url: &str) -> BoxFuture<'_, DownloadResult<Option<u64>>> {
        let url = url.to_string();
        let mut req = self.client.head(&url);
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }
        Box::pin(async move {
            let response = req.send().await.map_err(|e| DownloadError::Transfer {
                url: url.clone(),
                reason: e.to_string(),
            })?;
            Self::check_status(&url, response.status())?;
            Ok(response.content_length())
        })
    }

    fn get(&self, url: &str, start_offset: u64) -> BoxFuture<'_, DownloadResult<RemoteResponse>> {
        let url = url.to_string();
        let mut req = self.request(&url);
        if start_offset > 0 {
            req = req.header(reqwest::header::RANGE, format!("bytes={start_offset}-"));
        }
        Box::pin(async move {
            let response = req.send().await.map_err(|e| DownloadError::Transfer {
                url: url.clone(),
                reason: e.to_string(),
            })?;
            Self::check_status(&url, response.status())?;

            let content_length = response.content_length();
            let stream_url = url.clone();
            let stream = response
                .bytes_stream()
                .map_err(move |e| DownloadError::Transfer {
                    url: stream_url.clone(),
                    reason: e.to_string(),
                });

            Ok(RemoteResponse {
                content_length,
                stream: Box::pin(stream),
            })
        })
    }
}
