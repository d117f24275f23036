//! Durable transfer records.
//!
//! This module provides `SQLite`-backed persistence for transfers: identity,
//! destination, completed byte ranges and lifecycle status. It holds no
//! business logic; the scheduler and fetcher decide what to write.
//!
//! # Overview
//!
//! - [`TransferStore`] - `SQLite` implementation of the record contract
//! - [`TransferRepository`] - trait seam the engine depends on
//! - [`Transfer`] / [`TransferStatus`] - the record and its lifecycle states
//! - [`RangeSet`] - ordered, non-overlapping completed byte ranges
//! - [`StoreError`] - operation error types
//!
//! Every mutation is a single SQL statement, so a reader never observes a
//! half-applied progress update.

mod error;
mod ranges;
mod repository;
mod transfer;

pub use error::{StoreDbErrorKind, StoreError};
pub use ranges::{ByteRange, Gap, RangeSet};
pub use repository::TransferRepository;
pub use transfer::{Transfer, TransferId, TransferStatus};

use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::instrument;

use crate::db::Database;
use transfer::{TransferRow, now_millis_precision};

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Returns `Ok(())` if at least one row was affected; otherwise [`StoreError::NotFound`].
fn check_affected(id: &TransferId, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(StoreError::NotFound(id.clone()))
    } else {
        Ok(())
    }
}

fn to_db_size(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn encode_ranges(ranges: &RangeSet) -> Result<String> {
    serde_json::to_string(ranges).map_err(|e| StoreError::Encode(e.to_string()))
}

/// Ordering applied to [`TransferStore::list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListOrder {
    /// Most recently submitted first.
    #[default]
    NewestFirst,
    /// Submission order (FIFO).
    OldestFirst,
    /// Most recently completed first; uncompleted rows last.
    RecentlyCompleted,
}

/// Selection criteria for listing transfers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferFilter {
    /// Statuses to include; empty means every status.
    pub statuses: Vec<TransferStatus>,
    /// Result ordering.
    pub order: ListOrder,
}

impl TransferFilter {
    /// Every transfer, newest first.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Transfers in one status, newest first.
    #[must_use]
    pub fn status(status: TransferStatus) -> Self {
        Self {
            statuses: vec![status],
            order: ListOrder::NewestFirst,
        }
    }

    /// Transfers that are queued or running.
    #[must_use]
    pub fn active() -> Self {
        Self {
            statuses: vec![TransferStatus::Queued, TransferStatus::Active],
            order: ListOrder::NewestFirst,
        }
    }

    /// Completed transfers, most recently completed first.
    #[must_use]
    pub fn completed() -> Self {
        Self {
            statuses: vec![TransferStatus::Completed],
            order: ListOrder::RecentlyCompleted,
        }
    }

    /// Replaces the ordering.
    #[must_use]
    pub fn ordered(mut self, order: ListOrder) -> Self {
        self.order = order;
        self
    }
}

/// `SQLite`-backed transfer store.
#[derive(Debug, Clone)]
pub struct TransferStore {
    db: Database,
}

impl TransferStore {
    /// Creates a store over the given database connection.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts a transfer, or replaces every field of an existing one.
    ///
    /// Replacing keeps the record's original submission position.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the write fails.
    #[instrument(skip(self, transfer), fields(id = %transfer.id, status = %transfer.status))]
    pub async fn put(&self, transfer: &Transfer) -> Result<()> {
        let ranges = encode_ranges(&transfer.completed_ranges)?;
        let destination = transfer.destination_path.to_string_lossy();

        sqlx::query(
            r"INSERT INTO transfers (
                id,
                source,
                file_name,
                destination_path,
                mime_type,
                total_size,
                completed_ranges,
                status,
                attempt,
                last_error,
                speed_estimate,
                created_at,
                updated_at,
                completed_at
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
              ON CONFLICT(id) DO UPDATE SET
                source = excluded.source,
                file_name = excluded.file_name,
                destination_path = excluded.destination_path,
                mime_type = excluded.mime_type,
                total_size = excluded.total_size,
                completed_ranges = excluded.completed_ranges,
                status = excluded.status,
                attempt = excluded.attempt,
                last_error = excluded.last_error,
                speed_estimate = excluded.speed_estimate,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                completed_at = excluded.completed_at",
        )
        .bind(transfer.id.as_str())
        .bind(&transfer.source)
        .bind(&transfer.file_name)
        .bind(destination.as_ref())
        .bind(transfer.mime_type.as_deref())
        .bind(transfer.total_size.map(to_db_size))
        .bind(ranges)
        .bind(transfer.status.as_str())
        .bind(i64::from(transfer.attempt))
        .bind(transfer.last_error.as_deref())
        .bind(transfer.speed_estimate)
        .bind(transfer.created_at.timestamp_millis())
        .bind(transfer.updated_at.timestamp_millis())
        .bind(transfer.completed_at.map(|at| at.timestamp_millis()))
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    /// Gets a transfer by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails, or
    /// [`StoreError::Corrupt`] if the row cannot be decoded.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn get(&self, id: &TransferId) -> Result<Option<Transfer>> {
        let row = sqlx::query_as::<_, TransferRow>(r"SELECT * FROM transfers WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(self.db.pool())
            .await?;

        row.map(Transfer::try_from).transpose()
    }

    /// Lists transfers matching the filter.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails, or
    /// [`StoreError::Corrupt`] if a row cannot be decoded.
    #[instrument(skip(self))]
    pub async fn list(&self, filter: &TransferFilter) -> Result<Vec<Transfer>> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM transfers");
        if !filter.statuses.is_empty() {
            query.push(" WHERE status IN (");
            let mut separated = query.separated(", ");
            for status in &filter.statuses {
                separated.push_bind(status.as_str());
            }
            separated.push_unseparated(")");
        }
        query.push(match filter.order {
            ListOrder::NewestFirst => " ORDER BY seq DESC",
            ListOrder::OldestFirst => " ORDER BY seq ASC",
            ListOrder::RecentlyCompleted => {
                " ORDER BY completed_at IS NULL, completed_at DESC, seq DESC"
            }
        });

        let rows = query
            .build_query_as::<TransferRow>()
            .fetch_all(self.db.pool())
            .await?;

        rows.into_iter().map(Transfer::try_from).collect()
    }

    /// Deletes a transfer record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no record exists with the given id.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn delete(&self, id: &TransferId) -> Result<()> {
        let result = sqlx::query(r"DELETE FROM transfers WHERE id = ?")
            .bind(id.as_str())
            .execute(self.db.pool())
            .await?;

        check_affected(id, result.rows_affected())
    }

    /// Deletes every transfer record, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn delete_all(&self) -> Result<u64> {
        let result = sqlx::query(r"DELETE FROM transfers")
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected())
    }

    /// Records a progress checkpoint: ranges, total size and speed in one write.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no record exists with the given id.
    #[instrument(skip(self, ranges), fields(id = %id, covered = ranges.covered_len()))]
    pub async fn update_progress(
        &self,
        id: &TransferId,
        ranges: &RangeSet,
        total_size: Option<u64>,
        speed_estimate: f64,
    ) -> Result<()> {
        let encoded = encode_ranges(ranges)?;
        let result = sqlx::query(
            r"UPDATE transfers
              SET completed_ranges = ?, total_size = ?, speed_estimate = ?, updated_at = ?
              WHERE id = ?",
        )
        .bind(encoded)
        .bind(total_size.map(to_db_size))
        .bind(speed_estimate)
        .bind(now_millis_precision().timestamp_millis())
        .bind(id.as_str())
        .execute(self.db.pool())
        .await?;

        check_affected(id, result.rows_affected())
    }

    /// Sets the lifecycle status.
    ///
    /// Entering `Completed` stamps `completed_at` and clears `last_error`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no record exists with the given id.
    #[instrument(skip(self), fields(id = %id, status = %status))]
    pub async fn update_status(&self, id: &TransferId, status: TransferStatus) -> Result<()> {
        let now = now_millis_precision().timestamp_millis();
        let result = if status == TransferStatus::Completed {
            sqlx::query(
                r"UPDATE transfers
                  SET status = ?, completed_at = ?, last_error = NULL, speed_estimate = 0, updated_at = ?
                  WHERE id = ?",
            )
            .bind(status.as_str())
            .bind(now)
            .bind(now)
            .bind(id.as_str())
            .execute(self.db.pool())
            .await?
        } else {
            sqlx::query(
                r"UPDATE transfers
                  SET status = ?, updated_at = ?
                  WHERE id = ?",
            )
            .bind(status.as_str())
            .bind(now)
            .bind(id.as_str())
            .execute(self.db.pool())
            .await?
        };

        check_affected(id, result.rows_affected())
    }

    /// Sets the attempt counter and last error message.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no record exists with the given id.
    #[instrument(skip(self, last_error), fields(id = %id, attempt))]
    pub async fn update_attempt(
        &self,
        id: &TransferId,
        attempt: u32,
        last_error: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE transfers
              SET attempt = ?, last_error = ?, updated_at = ?
              WHERE id = ?",
        )
        .bind(i64::from(attempt))
        .bind(last_error)
        .bind(now_millis_precision().timestamp_millis())
        .bind(id.as_str())
        .execute(self.db.pool())
        .await?;

        check_affected(id, result.rows_affected())
    }

    /// Records the server-reported content type.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no record exists with the given id.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn set_mime_type(&self, id: &TransferId, mime_type: &str) -> Result<()> {
        let result = sqlx::query(r"UPDATE transfers SET mime_type = ? WHERE id = ?")
            .bind(mime_type)
            .bind(id.as_str())
            .execute(self.db.pool())
            .await?;

        check_affected(id, result.rows_affected())
    }

    /// Returns every `active` record to `queued`.
    ///
    /// Called at startup: rows still `active` belong to a process that died
    /// mid-transfer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn reset_interrupted(&self) -> Result<u64> {
        let result = sqlx::query(
            r"UPDATE transfers
              SET status = ?, speed_estimate = 0, updated_at = ?
              WHERE status = ?",
        )
        .bind(TransferStatus::Queued.as_str())
        .bind(now_millis_precision().timestamp_millis())
        .bind(TransferStatus::Active.as_str())
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected())
    }

    /// Counts transfers in a status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count_by_status(&self, status: TransferStatus) -> Result<i64> {
        let result = sqlx::query(r"SELECT COUNT(*) as count FROM transfers WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(self.db.pool())
            .await?;

        Ok(result.get("count"))
    }
}
