//! Errors surfaced synchronously to engine command callers.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::db::DbError;
use crate::fetch::FetchError;
use crate::store::{StoreError, TransferId, TransferStatus};

/// Errors returned by engine and scheduler commands.
///
/// Fetch failures are not reported here; they surface as `Failed` status
/// changes on the event bus.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No transfer has this id.
    #[error("transfer not found: {0}")]
    NotFound(TransferId),

    /// The command is not valid in the transfer's current state.
    #[error("cannot {operation} transfer {id} while it is {status}")]
    InvalidState {
        /// Transfer id.
        id: TransferId,
        /// Current status.
        status: TransferStatus,
        /// Rejected command.
        operation: &'static str,
    },

    /// The submitted source is not an absolute http(s) URL.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// Rejected input.
        url: String,
    },

    /// The destination file could not be reserved.
    #[error("cannot reserve destination in {dir}: {source}")]
    Destination {
        /// Destination directory.
        dir: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The HTTP client could not be built.
    #[error("HTTP client setup failed: {0}")]
    Client(#[source] FetchError),

    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The database could not be opened.
    #[error(transparent)]
    Database(#[from] DbError),

    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    pub(crate) fn invalid_state(
        id: &TransferId,
        status: TransferStatus,
        operation: &'static str,
    ) -> Self {
        Self::InvalidState {
            id: id.clone(),
            status,
            operation,
        }
    }

    pub(crate) fn destination(dir: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Destination {
            dir: dir.into(),
            source,
        }
    }
}

/// Result alias for engine commands.
pub type Result<T> = std::result::Result<T, EngineError>;
