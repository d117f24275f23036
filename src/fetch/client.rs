//! HTTP client wrapper for range requests.
//!
//! The client sends plain `GET`s with an optional `Range` header and turns
//! error statuses into [`FetchError`]s. Response bodies are never decoded
//! (no gzip), so every received byte maps to one byte on disk.

use std::time::Duration;

use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE, RANGE, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, instrument, warn};

use super::constants::{DEFAULT_CONNECT_TIMEOUT, MAX_RETRY_AFTER};
use super::error::FetchError;

/// `User-Agent` sent with every request.
pub const USER_AGENT: &str = concat!("transfer-manager/", env!("CARGO_PKG_VERSION"));

/// HTTP client shared by every fetch.
///
/// Created once per engine so connections are pooled across transfers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Creates a client with the default connect timeout.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Internal`] if the TLS backend cannot be initialised.
    pub fn new() -> Result<Self, FetchError> {
        Self::with_connect_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    /// Creates a client with an explicit connect timeout.
    ///
    /// There is no overall request timeout: large bodies legitimately take
    /// long, and idle connections are caught by the fetcher's stall timer.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Internal`] if the TLS backend cannot be initialised.
    pub fn with_connect_timeout(connect_timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| FetchError::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Sends a `GET`, optionally with a `Range` header.
    ///
    /// `416 Range Not Satisfiable` is returned as a response rather than an
    /// error so the caller can inspect `Content-Range`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Network`] for transport failures and
    /// [`FetchError::HttpStatus`] for any other non-2xx status.
    #[instrument(level = "debug", skip(self), fields(url = %url))]
    pub async fn get(&self, url: &str, range: Option<&str>) -> Result<Response, FetchError> {
        let mut request = self.client.get(url);
        if let Some(range) = range {
            request = request.header(RANGE, range);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::network(url, e))?;

        let status = response.status();
        debug!(status = status.as_u16(), "response received");
        if status.is_success() || status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        Err(FetchError::http_status_with_retry_after(
            url,
            status.as_u16(),
            retry_after,
        ))
    }
}

/// Returns the response `Content-Type`, without parameters.
pub(crate) fn content_type(response: &Response) -> Option<String> {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_ascii_lowercase)
}

/// Parsed `Content-Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContentRange {
    /// `bytes first-last/total` (total may be `*`).
    Bytes {
        first: u64,
        last: u64,
        total: Option<u64>,
    },
    /// `bytes */total`, sent with 416.
    Unsatisfied { total: u64 },
}

pub(crate) fn content_range(response: &Response) -> Option<ContentRange> {
    response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range)
}

/// Parses a `Content-Range` value such as `bytes 0-99/1000`.
pub(crate) fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (span, total) = rest.split_once('/')?;
    let total = total.trim();

    if span.trim() == "*" {
        return total
            .parse()
            .ok()
            .map(|total| ContentRange::Unsatisfied { total });
    }

    let (first, last) = span.trim().split_once('-')?;
    let first: u64 = first.trim().parse().ok()?;
    let last: u64 = last.trim().parse().ok()?;
    if last < first {
        return None;
    }
    let total = if total == "*" {
        None
    } else {
        Some(total.parse().ok()?)
    };

    Some(ContentRange::Bytes { first, last, total })
}

/// Parses a `Retry-After` header value (integer seconds or HTTP-date).
///
/// Values are capped at one hour; dates in the past yield zero.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        if duration > MAX_RETRY_AFTER {
            warn!(seconds, "Retry-After exceeds maximum, capping at 1 hour");
            return Some(MAX_RETRY_AFTER);
        }
        return Some(duration);
    }

    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        match datetime.duration_since(std::time::SystemTime::now()) {
            Ok(duration) => Some(duration.min(MAX_RETRY_AFTER)),
            Err(_) => Some(Duration::ZERO),
        }
    } else {
        debug!(header_value, "unparseable Retry-After value");
        None
    }
}
