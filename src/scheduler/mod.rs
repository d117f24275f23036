//! Task scheduling: admission, lifecycle and retries.
//!
//! The [`TaskScheduler`] owns the queue of waiting transfers and the set of
//! running ones. It is the only writer of `status`, `attempt` and
//! `last_error`. Every decision is taken while holding one async mutex, so
//! admission is strictly FIFO and never exceeds the concurrency bound.
//!
//! # Lifecycle
//!
//! ```text
//! Queued -> Active -> Completed | Paused | Failed | Cancelled
//! Paused -> Queued          Failed -> Queued (retry)
//! Queued | Failed -> Paused
//! any non-terminal -> Cancelled
//! Active -> Queued          (shutdown and crash recovery only)
//! ```
//!
//! Admission happens synchronously inside the command that frees or creates
//! work: after `submit` returns, the new transfer is already `Active` if a
//! slot was free.

mod progress;
mod worker;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::{EngineError, Result};
use crate::events::{EventBus, TransferEvent};
use crate::fetch::{
    FailureClass, FetchError, FetchOutcome, RangeFetcher, StopReason, StopSignal,
    derive_file_name, reserve_destination,
};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::{
    ListOrder, Transfer, TransferFilter, TransferId, TransferRepository, TransferStatus,
};

/// Default number of transfers fetched at once.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Largest accepted concurrency bound.
pub const MAX_CONCURRENT_LIMIT: usize = 100;

/// A running transfer.
struct ActiveTask {
    signal: StopSignal,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct State {
    running: bool,
    queue: VecDeque<TransferId>,
    active: HashMap<TransferId, ActiveTask>,
    retry_timers: HashMap<TransferId, JoinHandle<()>>,
    removing: HashSet<TransferId>,
}

impl State {
    fn cancel_timer(&mut self, id: &TransferId) -> bool {
        match self.retry_timers.remove(id) {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }

    fn dequeue(&mut self, id: &TransferId) {
        self.queue.retain(|queued| queued != id);
    }
}

/// What the scheduler does with a finished attempt.
#[derive(Debug)]
enum Resolution {
    Complete,
    Pause(Option<String>),
    Requeue,
    Cancel,
    Fail {
        error: FetchError,
        made_progress: bool,
    },
}

/// Combines a fetch outcome with the stop request that may have caused it.
///
/// A requested stop wins over a failure that raced with it; completion wins
/// over everything.
fn resolve(outcome: FetchOutcome, stop: Option<StopReason>) -> Resolution {
    match (outcome, stop) {
        (FetchOutcome::Completed { .. }, _) => Resolution::Complete,
        (FetchOutcome::Cancelled, _) | (_, Some(StopReason::Cancel)) => Resolution::Cancel,
        (FetchOutcome::Failed { error, .. }, Some(StopReason::Pause)) => {
            Resolution::Pause(Some(error.to_string()))
        }
        (FetchOutcome::Failed { .. } | FetchOutcome::Paused { .. }, Some(StopReason::Shutdown)) => {
            Resolution::Requeue
        }
        (FetchOutcome::Paused { .. }, _) => Resolution::Pause(None),
        (
            FetchOutcome::Failed {
                error,
                made_progress,
            },
            None,
        ) => Resolution::Fail {
            error,
            made_progress,
        },
    }
}

/// Command name used when refusing a transition into `to`.
fn transition_verb(to: TransferStatus) -> &'static str {
    match to {
        TransferStatus::Queued => "requeue",
        TransferStatus::Active => "activate",
        TransferStatus::Paused => "pause",
        TransferStatus::Completed => "complete",
        TransferStatus::Failed => "fail",
        TransferStatus::Cancelled => "cancel",
    }
}

pub(crate) struct Inner {
    store: Arc<dyn TransferRepository>,
    fetcher: RangeFetcher,
    retry: RetryPolicy,
    bus: EventBus,
    max_concurrent: usize,
    destination_dir: PathBuf,
    state: Mutex<State>,
}

/// Drives transfers through their lifecycle with bounded concurrency.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("max_concurrent", &self.inner.max_concurrent)
            .field("destination_dir", &self.inner.destination_dir)
            .finish_non_exhaustive()
    }
}

impl TaskScheduler {
    /// Creates an idle scheduler. Nothing is admitted until [`start`](Self::start).
    ///
    /// `max_concurrent` is clamped to `1..=100`.
    #[must_use]
    pub fn new(
        store: Arc<dyn TransferRepository>,
        fetcher: RangeFetcher,
        retry: RetryPolicy,
        bus: EventBus,
        max_concurrent: usize,
        destination_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                fetcher,
                retry,
                bus,
                max_concurrent: max_concurrent.clamp(1, MAX_CONCURRENT_LIMIT),
                destination_dir: destination_dir.into(),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Concurrency bound.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Directory new transfers are written to.
    #[must_use]
    pub fn destination_dir(&self) -> &Path {
        &self.inner.destination_dir
    }

    /// Requeues work left behind by a previous process.
    ///
    /// Transfers still marked `Active` are reset to `Queued`; every `Queued`
    /// transfer is loaded into the admission queue in submission order.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the store cannot be read or updated.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize> {
        let mut state = self.inner.state.lock().await;
        let interrupted = self.inner.store.reset_interrupted().await?;
        if interrupted > 0 {
            info!(interrupted, "requeued transfers interrupted by a previous run");
        }

        let queued = self
            .inner
            .store
            .list(&TransferFilter::status(TransferStatus::Queued).ordered(ListOrder::OldestFirst))
            .await?;
        let mut loaded = 0;
        for transfer in queued {
            if !state.queue.contains(&transfer.id) && !state.active.contains_key(&transfer.id) {
                state.queue.push_back(transfer.id);
                loaded += 1;
            }
        }
        debug!(loaded, "recovered queued transfers");
        if state.running {
            self.inner.pump(&mut state).await;
        }
        Ok(loaded)
    }

    /// Begins admitting queued transfers.
    #[instrument(skip(self))]
    pub async fn start(&self) {
        let mut state = self.inner.state.lock().await;
        state.running = true;
        self.inner.pump(&mut state).await;
    }

    /// Stops every running fetch and pending retry.
    ///
    /// Running transfers are checkpointed and persisted as `Queued`, as are
    /// transfers waiting for an automatic retry, so the next run picks them
    /// up. Returns once every worker has finished.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let waiters = {
            let mut state = self.inner.state.lock().await;
            state.running = false;

            let timers: Vec<TransferId> = state.retry_timers.keys().cloned().collect();
            for id in timers {
                state.cancel_timer(&id);
                if let Err(e) = self
                    .inner
                    .transition(&id, TransferStatus::Failed, TransferStatus::Queued, None, None)
                    .await
                {
                    warn!(%id, error = %e, "failed to requeue pending retry");
                }
            }

            state
                .active
                .values()
                .map(|task| {
                    task.signal.stop(StopReason::Shutdown);
                    task.done.clone()
                })
                .collect::<Vec<_>>()
        };

        info!(active = waiters.len(), "shutting down");
        for mut done in waiters {
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    /// Returns true when nothing is running, queued or waiting for a retry.
    pub async fn is_idle(&self) -> bool {
        let state = self.inner.state.lock().await;
        state.active.is_empty() && state.queue.is_empty() && state.retry_timers.is_empty()
    }

    /// Number of running transfers.
    pub async fn active_count(&self) -> usize {
        self.inner.state.lock().await.active.len()
    }

    /// Submits a new transfer and admits it if a slot is free.
    ///
    /// The file name is `name_hint` when given, else the last URL path
    /// segment. The destination file is created immediately; a taken name
    /// gets a numeric suffix.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidUrl`] if `source` is not an absolute http(s) URL
    /// - [`EngineError::Destination`] if the file cannot be created
    /// - [`EngineError::Store`] if the record cannot be written
    #[instrument(skip(self), fields(source = %source))]
    pub async fn submit(&self, source: &str, name_hint: Option<&str>) -> Result<TransferId> {
        let url = Url::parse(source.trim()).map_err(|_| EngineError::InvalidUrl {
            url: source.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(EngineError::InvalidUrl {
                url: source.to_string(),
            });
        }

        let dir = &self.inner.destination_dir;
        let file_name = derive_file_name(&url, name_hint);
        let path = reserve_destination(dir, &file_name)
            .await
            .map_err(|e| EngineError::destination(dir, e))?;
        let reserved_name = path
            .file_name()
            .map_or(file_name, |name| name.to_string_lossy().into_owned());

        let transfer = Transfer::new(url.as_str(), reserved_name, path.clone());
        if let Err(e) = self.inner.store.put(&transfer).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e.into());
        }
        let id = transfer.id.clone();
        info!(%id, path = %path.display(), "transfer submitted");

        let mut state = self.inner.state.lock().await;
        self.inner.bus.publish(TransferEvent::Created(transfer));
        state.queue.push_back(id.clone());
        self.inner.pump(&mut state).await;
        Ok(id)
    }

    /// Pauses a transfer.
    ///
    /// A running transfer is stopped and checkpointed; this returns once its
    /// slot is free. A queued transfer, or one waiting for a retry, moves
    /// straight to `Paused`.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown id, [`EngineError::InvalidState`]
    /// if the transfer is already paused, terminal, or failed with no retry
    /// pending.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn pause(&self, id: &TransferId) -> Result<()> {
        let mut done = {
            let mut state = self.inner.state.lock().await;
            let transfer = self.inner.load(id).await?;
            match transfer.status {
                TransferStatus::Active => {
                    let task = state
                        .active
                        .get(id)
                        .ok_or_else(|| EngineError::invalid_state(id, transfer.status, "pause"))?;
                    task.signal.stop(StopReason::Pause);
                    task.done.clone()
                }
                TransferStatus::Failed if !state.retry_timers.contains_key(id) => {
                    return Err(EngineError::invalid_state(id, transfer.status, "pause"));
                }
                TransferStatus::Queued | TransferStatus::Failed => {
                    state.dequeue(id);
                    state.cancel_timer(id);
                    self.inner.store.update_attempt(id, 0, transfer.last_error.as_deref()).await?;
                    self.inner
                        .transition(id, transfer.status, TransferStatus::Paused, None, None)
                        .await?;
                    return Ok(());
                }
                status => return Err(EngineError::invalid_state(id, status, "pause")),
            }
        };

        let _ = done.wait_for(|finished| *finished).await;
        Ok(())
    }

    /// Moves a paused transfer to the back of the queue.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown id, [`EngineError::InvalidState`]
    /// unless the transfer is `Paused`.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn resume(&self, id: &TransferId) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let transfer = self.inner.load(id).await?;
        if transfer.status != TransferStatus::Paused {
            return Err(EngineError::invalid_state(id, transfer.status, "resume"));
        }

        self.inner.store.update_attempt(id, 0, None).await?;
        self.inner
            .transition(id, TransferStatus::Paused, TransferStatus::Queued, None, None)
            .await?;
        state.queue.push_back(id.clone());
        self.inner.pump(&mut state).await;
        Ok(())
    }

    /// Cancels a transfer. The partial file stays on disk.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown id, [`EngineError::InvalidState`]
    /// if the transfer is already terminal.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn cancel(&self, id: &TransferId) -> Result<()> {
        let mut done = {
            let mut state = self.inner.state.lock().await;
            let transfer = self.inner.load(id).await?;
            match transfer.status {
                TransferStatus::Active => {
                    let task = state
                        .active
                        .get(id)
                        .ok_or_else(|| EngineError::invalid_state(id, transfer.status, "cancel"))?;
                    task.signal.stop(StopReason::Cancel);
                    task.done.clone()
                }
                status if status.is_terminal() => {
                    return Err(EngineError::invalid_state(id, status, "cancel"));
                }
                status => {
                    state.dequeue(id);
                    state.cancel_timer(id);
                    self.inner
                        .transition(id, status, TransferStatus::Cancelled, None, None)
                        .await?;
                    return Ok(());
                }
            }
        };

        let _ = done.wait_for(|finished| *finished).await;
        Ok(())
    }

    /// Requeues a failed transfer immediately, skipping any pending backoff.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown id, [`EngineError::InvalidState`]
    /// unless the transfer is `Failed`.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn retry_now(&self, id: &TransferId) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let transfer = self.inner.load(id).await?;
        if transfer.status != TransferStatus::Failed {
            return Err(EngineError::invalid_state(id, transfer.status, "retry"));
        }

        state.cancel_timer(id);
        self.inner.store.update_attempt(id, 0, None).await?;
        self.inner
            .transition(id, TransferStatus::Failed, TransferStatus::Queued, None, None)
            .await?;
        state.queue.push_back(id.clone());
        self.inner.pump(&mut state).await;
        Ok(())
    }

    /// Deletes a transfer record, stopping it first if it is running.
    ///
    /// The destination file is deleted too, unless the transfer completed.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown id.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn remove(&self, id: &TransferId) -> Result<()> {
        let running = {
            let mut state = self.inner.state.lock().await;
            let _ = self.inner.load(id).await?;
            state.removing.insert(id.clone());
            state.dequeue(id);
            state.cancel_timer(id);
            state.active.get(id).map(|task| {
                task.signal.stop(StopReason::Cancel);
                task.done.clone()
            })
        };

        if let Some(mut done) = running {
            let _ = done.wait_for(|finished| *finished).await;
        }

        let mut state = self.inner.state.lock().await;
        let result = self.inner.delete_record(&mut state, id).await;
        state.removing.remove(id);
        self.inner.pump(&mut state).await;
        result
    }

    /// Removes every transfer. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns the first store error encountered.
    #[instrument(skip(self))]
    pub async fn remove_all(&self) -> Result<usize> {
        let transfers = self.inner.store.list(&TransferFilter::all()).await?;
        let mut removed = 0;
        for transfer in transfers {
            match self.remove(&transfer.id).await {
                Ok(()) => removed += 1,
                Err(EngineError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let stragglers = self.inner.store.delete_all().await?;
        if stragglers > 0 {
            debug!(stragglers, "deleted records submitted during removal");
        }
        Ok(removed)
    }

    /// Reads one transfer.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown id.
    pub async fn get(&self, id: &TransferId) -> Result<Transfer> {
        self.inner.load(id).await
    }

    /// Lists transfers matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the store cannot be read.
    pub async fn list(&self, filter: &TransferFilter) -> Result<Vec<Transfer>> {
        Ok(self.inner.store.list(filter).await?)
    }
}

impl Inner {
    async fn load(&self, id: &TransferId) -> Result<Transfer> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.clone()))
    }

    fn publish_status(
        &self,
        id: &TransferId,
        from: TransferStatus,
        to: TransferStatus,
        error: Option<String>,
        retry_in: Option<Duration>,
    ) {
        self.bus.publish(TransferEvent::StatusChanged {
            id: id.clone(),
            from,
            to,
            error,
            retry_in,
        });
    }

    /// Persists a status change and announces it.
    ///
    /// An edge the lifecycle does not allow is refused with
    /// [`EngineError::InvalidState`] and nothing is written.
    async fn transition(
        &self,
        id: &TransferId,
        from: TransferStatus,
        to: TransferStatus,
        error: Option<String>,
        retry_in: Option<Duration>,
    ) -> Result<()> {
        if !from.can_transition_to(to) {
            warn!(%id, %from, %to, "refusing illegal transition");
            return Err(EngineError::invalid_state(id, from, transition_verb(to)));
        }
        self.store.update_status(id, to).await?;
        debug!(%id, %from, %to, "status changed");
        self.publish_status(id, from, to, error, retry_in);
        Ok(())
    }

    /// Admits queued transfers while slots are free.
    async fn pump(self: &Arc<Self>, state: &mut State) {
        while state.running && state.active.len() < self.max_concurrent {
            let Some(id) = state.queue.pop_front() else {
                break;
            };
            if state.removing.contains(&id) {
                debug!(%id, "skipping transfer being removed");
                continue;
            }

            let transfer = match self.store.get(&id).await {
                Ok(Some(transfer)) if transfer.status == TransferStatus::Queued => transfer,
                Ok(_) => {
                    debug!(%id, "dropping stale queue entry");
                    continue;
                }
                Err(e) => {
                    warn!(%id, error = %e, "failed to load queued transfer");
                    continue;
                }
            };

            if let Err(e) = self
                .transition(&id, TransferStatus::Queued, TransferStatus::Active, None, None)
                .await
            {
                warn!(%id, error = %e, "failed to activate transfer");
                continue;
            }

            let signal = StopSignal::new();
            let (done_tx, done_rx) = watch::channel(false);
            state.active.insert(
                id.clone(),
                ActiveTask {
                    signal: signal.clone(),
                    done: done_rx,
                },
            );
            let mut running = transfer;
            running.status = TransferStatus::Active;
            worker::spawn(Arc::clone(self), running, signal, done_tx);
        }
    }

    /// Applies the outcome of a finished attempt and refills free slots.
    async fn finish(self: &Arc<Self>, id: &TransferId, outcome: FetchOutcome) {
        let mut state = self.state.lock().await;
        let stop = state
            .active
            .remove(id)
            .and_then(|task| task.signal.reason());

        if state.removing.contains(id) {
            debug!(%id, "attempt finished for a transfer being removed");
        } else {
            let resolution = resolve(outcome, stop);
            if let Err(e) = self.apply(&mut state, id, resolution).await {
                warn!(%id, error = %e, "failed to record attempt outcome");
            }
        }

        self.pump(&mut state).await;
    }

    async fn apply(
        self: &Arc<Self>,
        state: &mut State,
        id: &TransferId,
        resolution: Resolution,
    ) -> Result<()> {
        let from = TransferStatus::Active;
        match resolution {
            Resolution::Complete => {
                self.store.update_attempt(id, 0, None).await?;
                self.transition(id, from, TransferStatus::Completed, None, None)
                    .await?;
                info!(%id, "transfer completed");
            }
            Resolution::Pause(error) => {
                self.store.update_attempt(id, 0, error.as_deref()).await?;
                self.transition(id, from, TransferStatus::Paused, error, None)
                    .await?;
            }
            Resolution::Requeue => {
                self.transition(id, from, TransferStatus::Queued, None, None)
                    .await?;
                if state.running {
                    state.queue.push_back(id.clone());
                }
            }
            Resolution::Cancel => {
                self.transition(id, from, TransferStatus::Cancelled, None, None)
                    .await?;
            }
            Resolution::Fail {
                error,
                made_progress,
            } => {
                // A size mismatch keeps counting even if bytes landed, so it
                // is retried once and no more.
                let previous = self.store.get(id).await?.map_or(0, |t| t.attempt);
                let advanced = made_progress && error.class() != FailureClass::SizeMismatch;
                let attempt = if advanced { 1 } else { previous + 1 };
                let message = error.to_string();
                let decision = self
                    .retry
                    .should_retry(attempt, error.class(), error.retry_after());

                self.store.update_attempt(id, attempt, Some(&message)).await?;
                match decision {
                    RetryDecision::Retry { delay } => {
                        warn!(%id, attempt, delay_ms = delay.as_millis(), error = %message, "attempt failed, will retry");
                        self.transition(id, from, TransferStatus::Failed, Some(message), Some(delay))
                            .await?;
                        self.schedule_retry(state, id, delay);
                    }
                    RetryDecision::DoNotRetry { reason } => {
                        warn!(%id, attempt, error = %message, %reason, "transfer failed");
                        self.transition(id, from, TransferStatus::Failed, Some(message), None)
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    fn schedule_retry(self: &Arc<Self>, state: &mut State, id: &TransferId, delay: Duration) {
        let inner = Arc::clone(self);
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.retry_due(&timer_id).await;
        });
        if let Some(previous) = state.retry_timers.insert(id.clone(), timer) {
            previous.abort();
        }
    }

    /// Requeues a failed transfer once its backoff has elapsed.
    async fn retry_due(self: &Arc<Self>, id: &TransferId) {
        let mut state = self.state.lock().await;
        state.retry_timers.remove(id);
        if !state.running || state.removing.contains(id) {
            return;
        }

        match self.store.get(id).await {
            Ok(Some(transfer)) if transfer.status == TransferStatus::Failed => {
                if let Err(e) = self
                    .transition(id, TransferStatus::Failed, TransferStatus::Queued, None, None)
                    .await
                {
                    warn!(%id, error = %e, "failed to requeue for retry");
                    return;
                }
                debug!(%id, attempt = transfer.attempt, "retrying");
                state.queue.push_back(id.clone());
                self.pump(&mut state).await;
            }
            Ok(_) => debug!(%id, "retry timer fired for a transfer no longer failed"),
            Err(e) => warn!(%id, error = %e, "failed to load transfer for retry"),
        }
    }

    /// Deletes a record and, unless it completed, its file.
    async fn delete_record(&self, state: &mut State, id: &TransferId) -> Result<()> {
        let transfer = self.load(id).await?;
        state.dequeue(id);
        state.cancel_timer(id);
        self.store.delete(id).await?;

        if transfer.status != TransferStatus::Completed {
            match tokio::fs::remove_file(&transfer.destination_path).await {
                Ok(()) => debug!(path = %transfer.destination_path.display(), "deleted partial file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %transfer.destination_path.display(), error = %e, "failed to delete file"),
            }
        }

        info!(%id, "transfer removed");
        self.bus.publish(TransferEvent::Removed { id: id.clone() });
        Ok(())
    }
}
