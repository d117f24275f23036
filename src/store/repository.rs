//! Repository seam for transfer persistence.
//!
//! The scheduler and fetcher depend on this trait rather than on
//! [`TransferStore`] directly, so tests can substitute a store that fails or
//! records calls.

use async_trait::async_trait;

use super::{
    RangeSet, Result, Transfer, TransferFilter, TransferId, TransferStatus, TransferStore,
};

/// Data-access contract for transfer records.
#[async_trait]
pub trait TransferRepository: Send + Sync {
    /// Inserts or fully replaces a record.
    async fn put(&self, transfer: &Transfer) -> Result<()>;

    /// Reads one record.
    async fn get(&self, id: &TransferId) -> Result<Option<Transfer>>;

    /// Lists records matching a filter.
    async fn list(&self, filter: &TransferFilter) -> Result<Vec<Transfer>>;

    /// Deletes one record.
    async fn delete(&self, id: &TransferId) -> Result<()>;

    /// Deletes every record.
    async fn delete_all(&self) -> Result<u64>;

    /// Atomically records ranges, total size and speed.
    async fn update_progress(
        &self,
        id: &TransferId,
        ranges: &RangeSet,
        total_size: Option<u64>,
        speed_estimate: f64,
    ) -> Result<()>;

    /// Sets the lifecycle status.
    async fn update_status(&self, id: &TransferId, status: TransferStatus) -> Result<()>;

    /// Sets attempt counter and last error.
    async fn update_attempt(
        &self,
        id: &TransferId,
        attempt: u32,
        last_error: Option<&str>,
    ) -> Result<()>;

    /// Records the response content type.
    async fn set_mime_type(&self, id: &TransferId, mime_type: &str) -> Result<()>;

    /// Requeues records left active by a previous process.
    async fn reset_interrupted(&self) -> Result<u64>;
}

#[async_trait]
impl TransferRepository for TransferStore {
    async fn put(&self, transfer: &Transfer) -> Result<()> {
        TransferStore::put(self, transfer).await
    }

    async fn get(&self, id: &TransferId) -> Result<Option<Transfer>> {
        TransferStore::get(self, id).await
    }

    async fn list(&self, filter: &TransferFilter) -> Result<Vec<Transfer>> {
        TransferStore::list(self, filter).await
    }

    async fn delete(&self, id: &TransferId) -> Result<()> {
        TransferStore::delete(self, id).await
    }

    async fn delete_all(&self) -> Result<u64> {
        TransferStore::delete_all(self).await
    }

    async fn update_progress(
        &self,
        id: &TransferId,
        ranges: &RangeSet,
        total_size: Option<u64>,
        speed_estimate: f64,
    ) -> Result<()> {
        TransferStore::update_progress(self, id, ranges, total_size, speed_estimate).await
    }

    async fn update_status(&self, id: &TransferId, status: TransferStatus) -> Result<()> {
        TransferStore::update_status(self, id, status).await
    }

    async fn update_attempt(
        &self,
        id: &TransferId,
        attempt: u32,
        last_error: Option<&str>,
    ) -> Result<()> {
        TransferStore::update_attempt(self, id, attempt, last_error).await
    }

    async fn set_mime_type(&self, id: &TransferId, mime_type: &str) -> Result<()> {
        TransferStore::set_mime_type(self, id, mime_type).await
    }

    async fn reset_interrupted(&self) -> Result<u64> {
        TransferStore::reset_interrupted(self).await
    }
}
