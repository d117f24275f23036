//! Assembly of the transfer engine from an [`EngineConfig`].

use std::path::Path;
use std::sync::Arc;

use tracing::{info, instrument};

use crate::config::EngineConfig;
use crate::db::Database;
use crate::error::{EngineError, Result};
use crate::events::{EventBus, Subscription};
use crate::fetch::{HttpClient, RangeFetcher};
use crate::scheduler::TaskScheduler;
use crate::store::{Transfer, TransferFilter, TransferId, TransferRepository, TransferStore};

/// A running transfer engine: store, HTTP client, scheduler and event bus.
///
/// Opening an engine recovers work left by a previous run, but nothing is
/// fetched until [`start`](Self::start) is called.
#[derive(Debug, Clone)]
pub struct Engine {
    db: Database,
    scheduler: TaskScheduler,
    bus: EventBus,
}

impl Engine {
    /// Validates `config`, opens the database and wires every component.
    ///
    /// The destination directory is created if missing. Transfers left
    /// `Active` by a crash are requeued.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the config is invalid, the destination
    /// directory cannot be created, or the database cannot be opened.
    #[instrument(skip(config), fields(db = %config.database_path.display()))]
    pub async fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.destination_dir)
            .await
            .map_err(|e| EngineError::destination(&config.destination_dir, e))?;
        if let Some(parent) = config.database_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::destination(parent, e))?;
        }

        let db = Database::new_with_options(&config.database_path, config.database_options())
            .await?;
        let engine = Self::with_database(db, &config)?;
        engine.scheduler.recover().await?;
        info!(
            destination = %config.destination_dir.display(),
            max_concurrent = config.max_concurrent,
            "engine ready"
        );
        Ok(engine)
    }

    /// Wires an engine over an already-open database. Does not recover.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Client`] if the HTTP client cannot be built.
    pub fn with_database(db: Database, config: &EngineConfig) -> Result<Self> {
        let store: Arc<dyn TransferRepository> = Arc::new(TransferStore::new(db.clone()));
        let client =
            HttpClient::with_connect_timeout(config.connect_timeout()).map_err(EngineError::Client)?;
        let fetcher = RangeFetcher::new(client, Arc::clone(&store), config.fetch_options());
        let bus = EventBus::with_progress_capacity(config.progress_capacity);
        let scheduler = TaskScheduler::new(
            store,
            fetcher,
            config.retry_policy(),
            bus.clone(),
            config.max_concurrent,
            config.destination_dir.clone(),
        );
        Ok(Self { db, scheduler, bus })
    }

    /// Begins fetching queued transfers.
    pub async fn start(&self) {
        self.scheduler.start().await;
    }

    /// Stops all fetches; running transfers are persisted as `Queued`.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    /// Shuts down and closes the database.
    pub async fn close(self) {
        self.scheduler.shutdown().await;
        self.db.close().await;
    }

    /// Subscribes to lifecycle and progress events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    /// Submits a URL. See [`TaskScheduler::submit`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the URL is invalid or the record cannot be created.
    pub async fn submit(&self, source: &str, name_hint: Option<&str>) -> Result<TransferId> {
        self.scheduler.submit(source, name_hint).await
    }

    /// Pauses a transfer. See [`TaskScheduler::pause`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] for unknown ids or invalid states.
    pub async fn pause(&self, id: &TransferId) -> Result<()> {
        self.scheduler.pause(id).await
    }

    /// Resumes a paused transfer.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] for unknown ids or invalid states.
    pub async fn resume(&self, id: &TransferId) -> Result<()> {
        self.scheduler.resume(id).await
    }

    /// Cancels a transfer.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] for unknown ids or invalid states.
    pub async fn cancel(&self, id: &TransferId) -> Result<()> {
        self.scheduler.cancel(id).await
    }

    /// Retries a failed transfer now.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] for unknown ids or invalid states.
    pub async fn retry_now(&self, id: &TransferId) -> Result<()> {
        self.scheduler.retry_now(id).await
    }

    /// Deletes a transfer record.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for unknown ids.
    pub async fn remove(&self, id: &TransferId) -> Result<()> {
        self.scheduler.remove(id).await
    }

    /// Deletes every transfer record.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the store fails.
    pub async fn remove_all(&self) -> Result<usize> {
        self.scheduler.remove_all().await
    }

    /// Reads one transfer.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for unknown ids.
    pub async fn get(&self, id: &TransferId) -> Result<Transfer> {
        self.scheduler.get(id).await
    }

    /// Lists transfers.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the store fails.
    pub async fn list(&self, filter: &TransferFilter) -> Result<Vec<Transfer>> {
        self.scheduler.list(filter).await
    }

    /// Returns true when nothing is running, queued or awaiting a retry.
    pub async fn is_idle(&self) -> bool {
        self.scheduler.is_idle().await
    }

    /// Number of running transfers.
    pub async fn active_count(&self) -> usize {
        self.scheduler.active_count().await
    }

    /// Directory new transfers are written to.
    #[must_use]
    pub fn destination_dir(&self) -> &Path {
        self.scheduler.destination_dir()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> EngineConfig {
        EngineConfig {
            destination_dir: dir.path().join("out"),
            database_path: dir.path().join("state").join("transfers.db"),
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_open_creates_directories() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(config(&dir)).await.unwrap();
        assert!(dir.path().join("out").is_dir());
        assert!(dir.path().join("state").join("transfers.db").exists());
        assert!(engine.is_idle().await);
        engine.close().await;
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig {
            max_concurrent: 0,
            ..config(&dir)
        };
        assert!(matches!(
            Engine::open(config).await,
            Err(EngineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_rejects_non_http_urls() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(config(&dir)).await.unwrap();
        for bad in ["ftp://example.com/a", "not a url", "file:///etc/passwd"] {
            assert!(matches!(
                engine.submit(bad, None).await,
                Err(EngineError::InvalidUrl { .. })
            ));
        }
        assert!(engine.list(&TransferFilter::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commands_on_unknown_id_are_not_found() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(config(&dir)).await.unwrap();
        let id = TransferId::from("missing");
        assert!(matches!(engine.pause(&id).await, Err(EngineError::NotFound(_))));
        assert!(matches!(engine.resume(&id).await, Err(EngineError::NotFound(_))));
        assert!(matches!(engine.cancel(&id).await, Err(EngineError::NotFound(_))));
        assert!(matches!(engine.remove(&id).await, Err(EngineError::NotFound(_))));
        assert!(matches!(engine.get(&id).await, Err(EngineError::NotFound(_))));
    }
}
