use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use url::Url;

use super::parser::{parse_document, FeedDocument};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Errors that can occur while retrieving the forum feed.
///
/// Any of these fails the current poll cycle only; the watcher logs it and
/// tries again on the next tick.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the 30-second timeout
    #[error("Request timed out")]
    Timeout,
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// Body could not be parsed as RSS or Atom
    #[error("Parse error: {0}")]
    Parse(String),
    /// Body is a feed but lacks fields the watcher relies on
    #[error("Malformed feed document: {0}")]
    Malformed(String),
    /// The feed URL could not be built from the base URL
    #[error("Invalid feed URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Where and how often to poll a phpBB board.
///
/// Immutable once handed to a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSource {
    pub base_url: Url,
    pub forum_id: u32,
    pub poll_interval: Duration,
}

impl FeedSource {
    pub fn new(base_url: Url, forum_id: u32, poll_interval: Duration) -> Self {
        Self {
            base_url,
            forum_id,
            poll_interval,
        }
    }

    /// Builds `{base_url}/feed.php?f={forum_id}`.
    ///
    /// `feed.php` is resolved relative to the base URL, so a base without a
    /// trailing slash loses its last path segment. The config layer
    /// normalizes the base URL to avoid that.
    pub fn feed_url(&self) -> Result<Url, FetchError> {
        let mut url = self.base_url.join("feed.php")?;
        url.set_query(Some(&format!("f={}", self.forum_id)));
        Ok(url)
    }
}

/// Capability to retrieve and parse the feed for a [`FeedSource`].
///
/// The watcher is generic over this trait so tests can drive it without a
/// network.
pub trait FetchFeed: Send + Sync {
    fn fetch(
        &self,
        source: &FeedSource,
    ) -> impl Future<Output = Result<FeedDocument, FetchError>> + Send;
}

/// Fetches the feed over HTTP with `reqwest`.
///
/// One request per call: no retries and no caching.
#[derive(Debug, Clone)]
pub struct HttpFeedFetcher {
    client: reqwest::Client,
}

impl HttpFeedFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("ircboard/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to build HTTP client, using defaults");
                reqwest::Client::new()
            });
        Self { client }
    }

    /// Uses a caller-provided client (custom proxy, TLS roots, etc.)
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpFeedFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchFeed for HttpFeedFetcher {
    /// # Errors
    ///
    /// - [`FetchError::Network`] - Connection or TLS errors
    /// - [`FetchError::Timeout`] - Request exceeded 30 seconds
    /// - [`FetchError::HttpStatus`] - Non-2xx HTTP response
    /// - [`FetchError::ResponseTooLarge`] - Response exceeded 10MB
    /// - [`FetchError::Parse`] / [`FetchError::Malformed`] - Unusable body
    async fn fetch(&self, source: &FeedSource) -> Result<FeedDocument, FetchError> {
        let url = source.feed_url()?;
        tracing::debug!(url = %url, "Fetching forum feed");

        // The deadline covers the body as well as the headers
        let bytes = tokio::time::timeout(FETCH_TIMEOUT, async {
            let response = self.client.get(url.as_str()).send().await?;
            if !response.status().is_success() {
                return Err(FetchError::HttpStatus(response.status().as_u16()));
            }
            read_limited_bytes(response, MAX_FEED_SIZE).await
        })
        .await
        .map_err(|_| FetchError::Timeout)??;

        parse_document(&bytes)
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
