//! Error types for range fetches.
//!
//! A [`FetchError`] never escapes the scheduler as an `Err`; it travels inside
//! [`FetchOutcome::Failed`](super::FetchOutcome::Failed) and is classified with
//! [`FetchError::class`] for retry decisions.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while fetching a transfer.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS resolution, connection refused, reset, TLS).
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL being fetched.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// No bytes arrived within the stall timeout.
    #[error("no data from {url} for {}s", .after.as_secs())]
    Stalled {
        /// The URL being fetched.
        url: String,
        /// How long the connection was idle.
        after: Duration,
    },

    /// HTTP error response.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// Parsed `Retry-After` delay, if the server sent one.
        retry_after: Option<Duration>,
    },

    /// Writing to the destination failed.
    #[error("IO error writing to {path}: {source}")]
    DiskWrite {
        /// The destination file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The server delivered a different number of bytes than it declared.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Declared total length.
        expected: u64,
        /// Length actually observed.
        actual: u64,
    },

    /// The source is not an absolute http(s) URL.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The fetch task died or the engine hit an unexpected condition.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

/// Coarse failure classification consumed by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Connection, TLS, reset or stall.
    Network,
    /// HTTP 4xx.
    ClientError(u16),
    /// HTTP 5xx (and any other unexpected status).
    ServerError(u16),
    /// Local filesystem failure.
    DiskWrite,
    /// Declared and received lengths disagree.
    SizeMismatch,
    /// Malformed source URL.
    InvalidUrl,
    /// Worker panic or engine fault.
    Internal,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::ClientError(code) => write!(f, "client_error({code})"),
            Self::ServerError(code) => write!(f, "server_error({code})"),
            Self::DiskWrite => write!(f, "disk_write"),
            Self::SizeMismatch => write!(f, "size_mismatch"),
            Self::InvalidUrl => write!(f, "invalid_url"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

impl FetchError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a stall error.
    pub fn stalled(url: impl Into<String>, after: Duration) -> Self {
        Self::Stalled {
            url: url.into(),
            after,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error carrying a parsed `Retry-After` delay.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<Duration>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a disk write error.
    pub fn disk(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::DiskWrite {
            path: path.into(),
            source,
        }
    }

    /// Creates a size mismatch error.
    pub fn size_mismatch(expected: u64, actual: u64) -> Self {
        Self::SizeMismatch { expected, actual }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classifies the error for retry decisions.
    #[must_use]
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Network { .. } | Self::Stalled { .. } => FailureClass::Network,
            Self::HttpStatus { status, .. } if (400..500).contains(status) => {
                FailureClass::ClientError(*status)
            }
            Self::HttpStatus { status, .. } => FailureClass::ServerError(*status),
            Self::DiskWrite { .. } => FailureClass::DiskWrite,
            Self::SizeMismatch { .. } => FailureClass::SizeMismatch,
            Self::InvalidUrl { .. } => FailureClass::InvalidUrl,
            Self::Internal { .. } => FailureClass::Internal,
        }
    }

    /// Server-requested delay before the next attempt, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::HttpStatus { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

// No `From<reqwest::Error>` / `From<std::io::Error>`: every variant needs the
// url or path for context, so callers go through the constructors above.
