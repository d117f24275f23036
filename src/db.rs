//! SQLite pool setup.
//!
//! [`Database`] opens the transfer database (creating the file if needed)
//! in WAL journal mode, so fetchers checkpointing progress never block a
//! reader listing transfers, and applies the embedded migrations before
//! handing out the pool.
//!
//! ```no_run
//! use transfer_core::{Database, TransferStore};
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = TransferStore::new(Database::new(Path::new("transfers.db")).await?);
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, instrument};

/// Pool size used when none is configured. SQLite serialises writers, so
/// more connections only help concurrent readers.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// How long a statement waits on another connection's lock, in milliseconds.
pub const DEFAULT_BUSY_TIMEOUT_MS: u32 = 5000;

/// Failure to bring the database up.
#[derive(Error, Debug)]
pub enum DbError {
    /// The file could not be opened or configured.
    #[error("cannot open database {location}: {source}")]
    Open {
        /// File path, or `:memory:`.
        location: String,
        /// Driver error.
        #[source]
        source: sqlx::Error,
    },

    /// The schema could not be brought up to date.
    #[error("database migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Tunables for the connection pool.
#[derive(Debug, Clone, Copy)]
pub struct DatabaseOptions {
    /// Maximum pooled connections.
    pub max_connections: u32,
    /// Lock wait per statement, in milliseconds.
    pub busy_timeout_ms: u32,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

/// Migrated SQLite pool. Clones share the pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens `path` with [`DatabaseOptions::default`].
    ///
    /// # Errors
    ///
    /// [`DbError::Open`] if the file cannot be opened, [`DbError::Migrate`]
    /// if the schema cannot be applied.
    pub async fn new(path: &Path) -> Result<Self, DbError> {
        Self::new_with_options(path, DatabaseOptions::default()).await
    }

    /// Opens `path` with explicit pool settings.
    ///
    /// # Errors
    ///
    /// [`DbError::Open`] if the file cannot be opened, [`DbError::Migrate`]
    /// if the schema cannot be applied.
    #[instrument(skip(path), fields(path = %path.display()))]
    pub async fn new_with_options(path: &Path, options: DatabaseOptions) -> Result<Self, DbError> {
        let connect = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(u64::from(options.busy_timeout_ms)));

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections.max(1))
            .connect_with(connect)
            .await
            .map_err(|source| DbError::Open {
                location: path.display().to_string(),
                source,
            })?;

        Self::migrated(pool).await
    }

    /// Opens a private in-memory database, used by tests.
    ///
    /// # Errors
    ///
    /// [`DbError::Open`] or [`DbError::Migrate`], as for a file.
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let open_error = |source| DbError::Open {
            location: ":memory:".to_string(),
            source,
        };
        let connect = SqliteConnectOptions::from_str("sqlite::memory:").map_err(open_error)?;

        // Every in-memory connection is its own database: keep exactly one
        // and never let the pool recycle it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect)
            .await
            .map_err(open_error)?;

        Self::migrated(pool).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self, DbError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!("schema up to date");
        Ok(Self { pool })
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Waits for in-flight statements and closes every connection.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}
