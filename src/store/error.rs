//! Error types for transfer store operations.

use std::fmt;

use thiserror::Error;

use super::transfer::TransferId;

/// Primary SQLite result codes the store distinguishes.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_CONSTRAINT: i32 = 19;

/// What kind of database failure a [`StoreError::Database`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreDbErrorKind {
    /// Another connection held the lock past the busy timeout.
    Busy,
    /// No pooled connection became free in time.
    PoolExhausted,
    /// The pool was closed, normally during shutdown.
    Closed,
    /// A schema constraint rejected the write.
    Constraint,
    /// Anything else.
    Other,
}

impl StoreDbErrorKind {
    fn of(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut => Self::PoolExhausted,
            sqlx::Error::PoolClosed => Self::Closed,
            sqlx::Error::Database(db) => {
                // SQLite reports extended codes; the low byte is the primary one.
                let primary = db
                    .code()
                    .and_then(|code| code.parse::<i32>().ok())
                    .map(|code| code & 0xff);
                match primary {
                    Some(SQLITE_BUSY | SQLITE_LOCKED) => Self::Busy,
                    Some(SQLITE_CONSTRAINT) => Self::Constraint,
                    _ => Self::Other,
                }
            }
            _ => Self::Other,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Busy => "busy",
            Self::PoolExhausted => "pool exhausted",
            Self::Closed => "closed",
            Self::Constraint => "constraint",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for StoreDbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during store operations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The database rejected or failed a statement.
    #[error("database error ({kind}): {message}")]
    Database {
        /// Classification used to decide whether to repeat the call.
        kind: StoreDbErrorKind,
        /// Driver message.
        message: String,
    },

    /// No record exists for the id.
    #[error("transfer not found: {0}")]
    NotFound(TransferId),

    /// A stored row could not be decoded.
    #[error("corrupt transfer record {id}: {reason}")]
    Corrupt {
        /// Id of the offending row.
        id: String,
        /// What failed to decode.
        reason: String,
    },

    /// Completed ranges could not be serialised.
    #[error("cannot encode completed ranges: {0}")]
    Encode(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: StoreDbErrorKind::of(&err),
            message: err.to_string(),
        }
    }
}

impl StoreError {
    /// Creates a `Corrupt` error for an undecodable row.
    #[must_use]
    pub fn corrupt(id: &str, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    /// True when repeating the same call may succeed without intervention:
    /// a lock held by another connection or a momentarily exhausted pool.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Database {
                kind: StoreDbErrorKind::Busy | StoreDbErrorKind::PoolExhausted,
                ..
            }
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::{Database, DatabaseOptions};

    #[test]
    fn test_pool_errors_are_classified() {
        let exhausted = StoreError::from(sqlx::Error::PoolTimedOut);
        assert!(exhausted.is_transient());
        assert!(exhausted.to_string().contains("pool exhausted"));

        let closed = StoreError::from(sqlx::Error::PoolClosed);
        assert!(!closed.is_transient());
        assert!(matches!(
            closed,
            StoreError::Database {
                kind: StoreDbErrorKind::Closed,
                ..
            }
        ));
    }

    #[test]
    fn test_not_found_is_permanent() {
        let err = StoreError::NotFound(TransferId::from("abc-123"));
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "transfer not found: abc-123");
    }

    #[tokio::test]
    async fn test_write_against_held_lock_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked.db");
        let holder = Database::new(&path).await.unwrap();
        let impatient = Database::new_with_options(
            &path,
            DatabaseOptions {
                max_connections: 1,
                busy_timeout_ms: 0,
            },
        )
        .await
        .unwrap();

        let mut conn = holder.pool().acquire().await.unwrap();
        sqlx::query("BEGIN EXCLUSIVE")
            .execute(&mut *conn)
            .await
            .unwrap();

        let err = sqlx::query("DELETE FROM transfers")
            .execute(impatient.pool())
            .await
            .unwrap_err();
        let err = StoreError::from(err);
        assert!(err.is_transient(), "got {err}");

        sqlx::query("ROLLBACK").execute(&mut *conn).await.unwrap();
    }
}
