//! Byte-range-aware fetching of a single transfer.
//!
//! # Overview
//!
//! - [`RangeFetcher`] - runs one fetch attempt for a transfer
//! - [`FetchOutcome`] - how the attempt ended
//! - [`StopSignal`] - cooperative pause/cancel/shutdown requests
//! - [`ProgressSink`] - receives progress after every chunk lands on disk
//! - [`HttpClient`] - shared `reqwest` wrapper
//! - [`FetchError`] / [`FailureClass`] - failure details and classification
//!
//! # Algorithm
//!
//! 1. Reconcile the persisted ranges with the file on disk. A file shorter
//!    than the last completed range means the ranges cannot be trusted, so
//!    they are cleared and the transfer starts over.
//! 2. Request the first uncovered region with a `Range` header, one request
//!    per gap, until nothing is missing.
//! 3. Buffer the body into fixed-size chunks; each chunk is written at its
//!    offset and flushed before its range is recorded.
//! 4. Checkpoint (fsync + store update) at least every `checkpoint_interval`
//!    or `checkpoint_bytes`, and on every pause.
//!
//! Only the fetcher writes `completed_ranges`, `total_size` and `mime_type`.

mod client;
mod constants;
mod error;
mod filename;
mod signal;

pub use client::{HttpClient, USER_AGENT, parse_retry_after};
pub use constants::{
    CHECKPOINT_STORE_BACKOFF, CHECKPOINT_STORE_RETRIES, DEFAULT_CHECKPOINT_BYTES,
    DEFAULT_CHECKPOINT_INTERVAL, DEFAULT_CHUNK_SIZE, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_STALL_TIMEOUT, MAX_RETRY_AFTER,
};
pub use error::{FailureClass, FetchError};
pub use filename::{derive_file_name, reserve_destination, sanitize_filename};
pub use signal::{StopReason, StopSignal};

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::{Response, StatusCode};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::store::{Gap, RangeSet, Transfer, TransferId, TransferRepository};
use client::{ContentRange, content_range, content_type};

/// Receives progress after each chunk is written and flushed.
pub trait ProgressSink: Send + Sync {
    /// Records `delta` new bytes; returns the current speed estimate (bytes/s).
    fn on_progress(&self, completed_bytes: u64, total_size: Option<u64>, delta: u64) -> f64;
}

/// How a fetch attempt ended.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Every byte is on disk.
    Completed {
        /// Final length of the resource.
        total_size: u64,
    },
    /// Stopped by pause or shutdown; progress is checkpointed.
    Paused {
        /// Ranges on disk at the time of the stop.
        ranges: RangeSet,
    },
    /// Stopped by cancel.
    Cancelled,
    /// The attempt failed.
    Failed {
        /// What went wrong.
        error: FetchError,
        /// True if the attempt grew coverage past what it started with and
        /// never discarded recorded ranges.
        made_progress: bool,
    },
}

impl FetchOutcome {
    /// Convenience for failures that happen before any byte is written.
    #[must_use]
    pub fn failed(error: FetchError) -> Self {
        Self::Failed {
            error,
            made_progress: false,
        }
    }
}

/// Tunables for a fetch.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Bytes per disk write.
    pub chunk_size: usize,
    /// Maximum time between checkpoints.
    pub checkpoint_interval: Duration,
    /// Maximum bytes between checkpoints.
    pub checkpoint_bytes: u64,
    /// Idle time after which the connection is considered dead.
    pub stall_timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            checkpoint_bytes: DEFAULT_CHECKPOINT_BYTES,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }
}

/// Runs fetch attempts against a shared HTTP client and store.
#[derive(Clone)]
pub struct RangeFetcher {
    client: HttpClient,
    store: Arc<dyn TransferRepository>,
    options: FetchOptions,
}

impl std::fmt::Debug for RangeFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeFetcher")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl RangeFetcher {
    /// Creates a fetcher.
    #[must_use]
    pub fn new(client: HttpClient, store: Arc<dyn TransferRepository>, options: FetchOptions) -> Self {
        Self {
            client,
            store,
            options,
        }
    }

    /// Returns the configured options.
    #[must_use]
    pub fn options(&self) -> &FetchOptions {
        &self.options
    }

    /// Runs one attempt for `transfer` until it completes, stops or fails.
    ///
    /// Never returns an `Err`: every failure is reported as
    /// [`FetchOutcome::Failed`].
    #[instrument(skip_all, fields(id = %transfer.id, url = %transfer.source))]
    pub async fn fetch(
        &self,
        transfer: &Transfer,
        signal: &StopSignal,
        sink: &dyn ProgressSink,
    ) -> FetchOutcome {
        if signal.reason() == Some(StopReason::Cancel) {
            return FetchOutcome::Cancelled;
        }

        let mut session = match Session::open(self, transfer, sink).await {
            Ok(session) => session,
            Err(error) => return FetchOutcome::failed(error),
        };
        session.run(signal).await
    }
}

/// Result of one HTTP request inside an attempt.
enum Flow {
    /// The request finished; look for the next gap.
    Next,
    /// A stop was requested.
    Stopped(StopReason),
}

fn stop_reason(signal: &StopSignal) -> StopReason {
    signal.reason().unwrap_or(StopReason::Cancel)
}

/// State of one fetch attempt.
struct Session<'a> {
    fetcher: &'a RangeFetcher,
    sink: &'a dyn ProgressSink,
    id: TransferId,
    url: String,
    path: PathBuf,
    file: File,
    ranges: RangeSet,
    total: Option<u64>,
    mime_type: Option<String>,
    /// Covered bytes when the attempt began.
    initial_covered: u64,
    /// Set once recorded ranges were thrown away during this attempt.
    restarted: bool,
    /// Set once any chunk was written during this attempt.
    wrote_chunks: bool,
    speed: f64,
    since_checkpoint: u64,
    last_checkpoint: Instant,
}

impl<'a> Session<'a> {
    async fn open(
        fetcher: &'a RangeFetcher,
        transfer: &Transfer,
        sink: &'a dyn ProgressSink,
    ) -> Result<Self, FetchError> {
        let parsed =
            Url::parse(&transfer.source).map_err(|_| FetchError::invalid_url(&transfer.source))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::invalid_url(&transfer.source));
        }

        let path = transfer.destination_path.clone();
        let on_disk = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(FetchError::disk(path, e)),
        };

        let mut ranges = transfer.completed_ranges.clone();
        let initial_covered = ranges.covered_len();
        let mut restarted = false;
        let total = transfer.total_size;
        let beyond_total = total.is_some_and(|t| ranges.max_end() > t);
        if on_disk < ranges.max_end() || beyond_total {
            warn!(
                on_disk,
                recorded_end = ranges.max_end(),
                "completed ranges do not match file, restarting from zero"
            );
            ranges.clear();
            restarted = initial_covered > 0;
            fetcher
                .store
                .update_progress(&transfer.id, &ranges, total, 0.0)
                .await
                .map_err(|e| FetchError::internal(format!("failed to reset progress: {e}")))?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|e| FetchError::disk(&path, e))?;

        debug!(ranges = %ranges, total = ?total, "fetch session opened");

        Ok(Self {
            fetcher,
            sink,
            id: transfer.id.clone(),
            url: transfer.source.clone(),
            path,
            file,
            ranges,
            total,
            mime_type: transfer.mime_type.clone(),
            initial_covered,
            restarted,
            wrote_chunks: false,
            speed: 0.0,
            since_checkpoint: 0,
            last_checkpoint: Instant::now(),
        })
    }

    async fn run(&mut self, signal: &StopSignal) -> FetchOutcome {
        loop {
            if signal.is_stopped() {
                return self.stop(stop_reason(signal)).await;
            }

            let Some(gap) = self.ranges.first_gap(self.total) else {
                return self.complete().await;
            };

            match self.fetch_gap(gap, signal).await {
                Ok(Flow::Next) => {}
                Ok(Flow::Stopped(reason)) => return self.stop(reason).await,
                Err(error) => return self.fail(error).await,
            }
        }
    }

    async fn fetch_gap(&mut self, gap: Gap, signal: &StopSignal) -> Result<Flow, FetchError> {
        let stall = self.fetcher.options.stall_timeout;
        let range_header = (gap.start > 0 || gap.end.is_some()).then(|| gap.to_header_value());
        debug!(range = ?range_header, "requesting");

        let response = tokio::select! {
            biased;
            () = signal.stopped() => return Ok(Flow::Stopped(stop_reason(signal))),
            result = tokio::time::timeout(
                stall,
                self.fetcher.client.get(&self.url, range_header.as_deref()),
            ) => match result {
                Ok(response) => response?,
                Err(_) => return Err(FetchError::stalled(&self.url, stall)),
            },
        };

        self.record_mime_type(&response).await;

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return self.range_not_satisfiable(&response).await;
        }

        let (start, limit) = if status == StatusCode::PARTIAL_CONTENT {
            match content_range(&response) {
                Some(ContentRange::Bytes { first, last, total }) if first == gap.start => {
                    if let Some(reported) = total {
                        if let Some(known) = self.total
                            && known != reported
                        {
                            self.reset_ranges().await;
                            return Err(FetchError::size_mismatch(known, reported));
                        }
                        self.total = Some(reported);
                    }
                    let end = last.saturating_add(1);
                    (first, Some(gap.end.map_or(end, |gap_end| gap_end.min(end))))
                }
                other => {
                    warn!(requested = gap.start, content_range = ?other, "unusable 206, refetching from zero");
                    self.reset_ranges().await;
                    return Ok(Flow::Next);
                }
            }
        } else {
            if gap.start > 0 || !self.ranges.is_empty() {
                info!(
                    requested = gap.start,
                    "server ignored range request, restarting from zero"
                );
                self.restarted = true;
            }
            self.ranges.clear();
            self.total = response.content_length();
            self.file
                .set_len(0)
                .await
                .map_err(|e| FetchError::disk(&self.path, e))?;
            (0, None)
        };

        self.stream_body(response, start, limit, signal).await
    }

    async fn stream_body(
        &mut self,
        response: Response,
        start: u64,
        limit: Option<u64>,
        signal: &StopSignal,
    ) -> Result<Flow, FetchError> {
        let stall = self.fetcher.options.stall_timeout;
        let chunk_size = self.fetcher.options.chunk_size;
        let mut offset = start;
        let mut buffer: Vec<u8> = Vec::with_capacity(chunk_size);
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                () = signal.stopped() => {
                    let reason = stop_reason(signal);
                    if reason != StopReason::Cancel {
                        self.write_chunk(&mut offset, &mut buffer).await?;
                    }
                    return Ok(Flow::Stopped(reason));
                }
                next = tokio::time::timeout(stall, stream.next()) => next,
            };

            let Ok(next) = next else {
                self.write_chunk(&mut offset, &mut buffer).await?;
                return Err(FetchError::stalled(&self.url, stall));
            };

            let bytes = match next {
                None => break,
                Some(Err(e)) => {
                    self.write_chunk(&mut offset, &mut buffer).await?;
                    return Err(FetchError::network(&self.url, e));
                }
                Some(Ok(bytes)) => bytes,
            };

            let buffered_end = offset + buffer.len() as u64;
            let mut take = bytes.len();
            let mut reached_limit = false;
            if let Some(limit) = limit {
                let room = usize::try_from(limit.saturating_sub(buffered_end)).unwrap_or(usize::MAX);
                if take >= room {
                    take = room;
                    reached_limit = true;
                }
            }

            let received_end = buffered_end + take as u64;
            if let Some(total) = self.total
                && received_end > total
            {
                warn!(total, received_end, "server sent more bytes than declared");
                self.reset_ranges().await;
                return Err(FetchError::size_mismatch(total, received_end));
            }

            buffer.extend_from_slice(&bytes[..take]);
            if buffer.len() >= chunk_size {
                self.write_chunk(&mut offset, &mut buffer).await?;
            }
            if reached_limit {
                break;
            }
        }

        self.write_chunk(&mut offset, &mut buffer).await?;

        match limit {
            Some(limit) if offset < limit => Err(FetchError::size_mismatch(limit, offset)),
            Some(_) => Ok(Flow::Next),
            None => match self.total {
                Some(total) if offset != total => Err(FetchError::size_mismatch(total, offset)),
                Some(_) => Ok(Flow::Next),
                None => {
                    self.total = Some(offset);
                    Ok(Flow::Next)
                }
            },
        }
    }

    async fn range_not_satisfiable(&mut self, response: &Response) -> Result<Flow, FetchError> {
        let reported = match content_range(response) {
            Some(ContentRange::Unsatisfied { total }) => Some(total),
            _ => None,
        };

        if let Some(total) = self.total.or(reported)
            && self.ranges.covers(total)
        {
            debug!(total, "416 for a fully covered resource");
            self.total = Some(total);
            return Ok(Flow::Next);
        }

        let expected = self.total.or(reported).unwrap_or(0);
        let actual = self.ranges.covered_len();
        self.reset_ranges().await;
        Err(FetchError::size_mismatch(expected, actual))
    }

    /// Writes and flushes the buffered bytes at `offset`, then records them.
    async fn write_chunk(&mut self, offset: &mut u64, buffer: &mut Vec<u8>) -> Result<(), FetchError> {
        if buffer.is_empty() {
            return Ok(());
        }

        self.file
            .seek(SeekFrom::Start(*offset))
            .await
            .map_err(|e| FetchError::disk(&self.path, e))?;
        self.file
            .write_all(buffer)
            .await
            .map_err(|e| FetchError::disk(&self.path, e))?;
        self.file
            .flush()
            .await
            .map_err(|e| FetchError::disk(&self.path, e))?;

        let len = buffer.len() as u64;
        self.ranges.insert(*offset, *offset + len);
        *offset += len;
        buffer.clear();
        self.wrote_chunks = true;
        self.since_checkpoint += len;
        self.speed = self
            .sink
            .on_progress(self.ranges.covered_len(), self.total, len);

        let options = &self.fetcher.options;
        if self.since_checkpoint >= options.checkpoint_bytes
            || self.last_checkpoint.elapsed() >= options.checkpoint_interval
        {
            if let Err(error) = self.checkpoint().await {
                if matches!(error, FetchError::DiskWrite { .. }) {
                    return Err(error);
                }
                warn!(error = %error, "periodic checkpoint failed");
            }
        }
        Ok(())
    }

    /// Syncs file data and persists the current ranges.
    ///
    /// A store write that fails on a lock or an exhausted pool is repeated
    /// with backoff before the checkpoint counts as failed.
    async fn checkpoint(&mut self) -> Result<(), FetchError> {
        self.file
            .sync_data()
            .await
            .map_err(|e| FetchError::disk(&self.path, e))?;

        let mut backoff = CHECKPOINT_STORE_BACKOFF;
        let mut retries_left = CHECKPOINT_STORE_RETRIES;
        loop {
            match self
                .fetcher
                .store
                .update_progress(&self.id, &self.ranges, self.total, self.speed)
                .await
            {
                Ok(()) => break,
                Err(e) if e.is_transient() && retries_left > 0 => {
                    debug!(error = %e, retries_left, "checkpoint write contended, retrying");
                    retries_left -= 1;
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    return Err(FetchError::internal(format!(
                        "failed to persist progress: {e}"
                    )));
                }
            }
        }
        self.since_checkpoint = 0;
        self.last_checkpoint = Instant::now();
        debug!(covered = self.ranges.covered_len(), "checkpoint");
        Ok(())
    }

    async fn record_mime_type(&mut self, response: &Response) {
        let Some(mime) = content_type(response) else {
            return;
        };
        if self.mime_type.as_deref() == Some(mime.as_str()) {
            return;
        }
        if let Err(e) = self.fetcher.store.set_mime_type(&self.id, &mime).await {
            warn!(error = %e, "failed to record content type");
            return;
        }
        self.mime_type = Some(mime);
    }

    /// Discards every recorded range so the next request starts at zero.
    async fn reset_ranges(&mut self) {
        self.restarted |= !self.ranges.is_empty();
        self.ranges.clear();
        self.total = None;
        if let Err(e) = self.file.set_len(0).await {
            warn!(error = %e, "failed to truncate destination");
        }
        if let Err(e) = self
            .fetcher
            .store
            .update_progress(&self.id, &self.ranges, None, 0.0)
            .await
        {
            warn!(error = %e, "failed to persist range reset");
        }
    }

    async fn stop(&mut self, reason: StopReason) -> FetchOutcome {
        if reason == StopReason::Cancel {
            debug!("fetch cancelled");
            return FetchOutcome::Cancelled;
        }

        if let Err(error) = self.checkpoint().await {
            return FetchOutcome::Failed {
                error,
                made_progress: self.advanced(),
            };
        }
        debug!(%reason, covered = self.ranges.covered_len(), "fetch stopped");
        FetchOutcome::Paused {
            ranges: self.ranges.clone(),
        }
    }

    async fn complete(&mut self) -> FetchOutcome {
        let total = self.total.unwrap_or_else(|| self.ranges.max_end());
        self.total = Some(total);

        let on_disk = match self.file.metadata().await {
            Ok(meta) => meta.len(),
            Err(e) => return self.fail(FetchError::disk(&self.path, e)).await,
        };
        if on_disk > total
            && let Err(e) = self.file.set_len(total).await
        {
            return self.fail(FetchError::disk(&self.path, e)).await;
        }

        if let Err(error) = self.checkpoint().await {
            return FetchOutcome::Failed {
                error,
                made_progress: self.advanced(),
            };
        }

        info!(path = %self.path.display(), bytes = total, "fetch complete");
        FetchOutcome::Completed { total_size: total }
    }

    async fn fail(&mut self, error: FetchError) -> FetchOutcome {
        debug!(error = %error, class = %error.class(), "fetch attempt failed");
        if self.wrote_chunks
            && let Err(e) = self.checkpoint().await
        {
            warn!(error = %e, "failed to checkpoint after error");
        }
        FetchOutcome::Failed {
            error,
            made_progress: self.advanced(),
        }
    }

    /// Whether this attempt moved the transfer forward overall.
    fn advanced(&self) -> bool {
        !self.restarted && self.ranges.covered_len() > self.initial_covered
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::Database;
    use crate::store::{
        StoreDbErrorKind, StoreError, TransferFilter, TransferStatus, TransferStore,
    };
    use tempfile::TempDir;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct RecordingSink {
        reports: Mutex<Vec<u64>>,
    }

    impl ProgressSink for RecordingSink {
        fn on_progress(&self, completed_bytes: u64, _total: Option<u64>, _delta: u64) -> f64 {
            self.reports.lock().unwrap().push(completed_bytes);
            0.0
        }
    }

    /// Store whose next `busy_writes` progress writes fail as if locked.
    struct ContendedStore {
        inner: TransferStore,
        busy_writes: AtomicU32,
    }

    #[async_trait]
    impl TransferRepository for ContendedStore {
        async fn put(&self, transfer: &Transfer) -> crate::store::Result<()> {
            self.inner.put(transfer).await
        }
        async fn get(&self, id: &TransferId) -> crate::store::Result<Option<Transfer>> {
            self.inner.get(id).await
        }
        async fn list(&self, filter: &TransferFilter) -> crate::store::Result<Vec<Transfer>> {
            self.inner.list(filter).await
        }
        async fn delete(&self, id: &TransferId) -> crate::store::Result<()> {
            self.inner.delete(id).await
        }
        async fn delete_all(&self) -> crate::store::Result<u64> {
            self.inner.delete_all().await
        }
        async fn update_progress(
            &self,
            id: &TransferId,
            ranges: &RangeSet,
            total_size: Option<u64>,
            speed_estimate: f64,
        ) -> crate::store::Result<()> {
            let busy = self
                .busy_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if busy {
                return Err(StoreError::Database {
                    kind: StoreDbErrorKind::Busy,
                    message: "database is locked".to_string(),
                });
            }
            self.inner
                .update_progress(id, ranges, total_size, speed_estimate)
                .await
        }
        async fn update_status(
            &self,
            id: &TransferId,
            status: TransferStatus,
        ) -> crate::store::Result<()> {
            self.inner.update_status(id, status).await
        }
        async fn update_attempt(
            &self,
            id: &TransferId,
            attempt: u32,
            last_error: Option<&str>,
        ) -> crate::store::Result<()> {
            self.inner.update_attempt(id, attempt, last_error).await
        }
        async fn set_mime_type(&self, id: &TransferId, mime_type: &str) -> crate::store::Result<()> {
            self.inner.set_mime_type(id, mime_type).await
        }
        async fn reset_interrupted(&self) -> crate::store::Result<u64> {
            self.inner.reset_interrupted().await
        }
    }

    async fn contended_fetcher(busy_writes: u32) -> (Arc<ContendedStore>, RangeFetcher) {
        let store = Arc::new(ContendedStore {
            inner: TransferStore::new(Database::new_in_memory().await.unwrap()),
            busy_writes: AtomicU32::new(busy_writes),
        });
        let fetcher = RangeFetcher::new(
            HttpClient::new().unwrap(),
            store.clone(),
            FetchOptions::default(),
        );
        (store, fetcher)
    }

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn setup(url: &str) -> (TempDir, Arc<TransferStore>, RangeFetcher, Transfer) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TransferStore::new(Database::new_in_memory().await.unwrap()));
        let fetcher = RangeFetcher::new(
            HttpClient::new().unwrap(),
            store.clone(),
            FetchOptions {
                chunk_size: 1024,
                ..FetchOptions::default()
            },
        );
        let path = reserve_destination(dir.path(), "file.bin").await.unwrap();
        let mut transfer = Transfer::new(url, "file.bin", path);
        transfer.status = TransferStatus::Active;
        store.put(&transfer).await.unwrap();
        (dir, store, fetcher, transfer)
    }

    #[tokio::test]
    async fn test_fetch_full_body_completes_and_records_mime() {
        let server = MockServer::start().await;
        let payload = body(5000);
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/octet-stream")
                    .set_body_bytes(payload.clone()),
            )
            .mount(&server)
            .await;

        let (_dir, store, fetcher, transfer) = setup(&format!("{}/file.bin", server.uri())).await;
        let sink = RecordingSink::default();
        let outcome = fetcher.fetch(&transfer, &StopSignal::new(), &sink).await;

        assert!(matches!(outcome, FetchOutcome::Completed { total_size: 5000 }));
        assert_eq!(std::fs::read(&transfer.destination_path).unwrap(), payload);

        let stored = store.get(&transfer.id).await.unwrap().unwrap();
        assert_eq!(stored.total_size, Some(5000));
        assert!(stored.completed_ranges.covers(5000));
        assert_eq!(stored.mime_type.as_deref(), Some("application/octet-stream"));
        assert_eq!(sink.reports.lock().unwrap().last(), Some(&5000));
    }

    #[tokio::test]
    async fn test_fetch_resumes_from_first_gap_with_range_header() {
        let server = MockServer::start().await;
        let payload = body(3000);
        Mock::given(method("GET"))
            .and(header("range", "bytes=1000-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 1000-2999/3000")
                    .set_body_bytes(payload[1000..].to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (_dir, store, fetcher, mut transfer) = setup(&format!("{}/f", server.uri())).await;
        std::fs::write(&transfer.destination_path, &payload[..1000]).unwrap();
        transfer.completed_ranges.insert(0, 1000);
        transfer.total_size = Some(3000);
        store.put(&transfer).await.unwrap();

        let sink = RecordingSink::default();
        let outcome = fetcher.fetch(&transfer, &StopSignal::new(), &sink).await;

        assert!(matches!(outcome, FetchOutcome::Completed { total_size: 3000 }));
        assert_eq!(std::fs::read(&transfer.destination_path).unwrap(), payload);
        assert!(sink.reports.lock().unwrap().iter().all(|&n| n > 1000));
    }

    #[tokio::test]
    async fn test_fetch_restarts_when_server_ignores_range() {
        let server = MockServer::start().await;
        let payload = body(2048);
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
            .mount(&server)
            .await;

        let (_dir, store, fetcher, mut transfer) = setup(&format!("{}/f", server.uri())).await;
        std::fs::write(&transfer.destination_path, vec![0xFFu8; 512]).unwrap();
        transfer.completed_ranges.insert(0, 512);
        store.put(&transfer).await.unwrap();

        let outcome = fetcher
            .fetch(&transfer, &StopSignal::new(), &RecordingSink::default())
            .await;

        assert!(matches!(outcome, FetchOutcome::Completed { total_size: 2048 }));
        assert_eq!(std::fs::read(&transfer.destination_path).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_fetch_clears_ranges_when_file_is_shorter() {
        let server = MockServer::start().await;
        let payload = body(1500);
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let (_dir, store, fetcher, mut transfer) = setup(&format!("{}/f", server.uri())).await;
        transfer.completed_ranges.insert(0, 1000);
        store.put(&transfer).await.unwrap();

        let outcome = fetcher
            .fetch(&transfer, &StopSignal::new(), &RecordingSink::default())
            .await;
        assert!(matches!(outcome, FetchOutcome::Completed { total_size: 1500 }));
    }

    #[tokio::test]
    async fn test_fetch_already_covered_completes_without_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let (_dir, store, fetcher, mut transfer) = setup(&format!("{}/f", server.uri())).await;
        std::fs::write(&transfer.destination_path, body(100)).unwrap();
        transfer.completed_ranges.insert(0, 100);
        transfer.total_size = Some(100);
        store.put(&transfer).await.unwrap();

        let outcome = fetcher
            .fetch(&transfer, &StopSignal::new(), &RecordingSink::default())
            .await;
        assert!(matches!(outcome, FetchOutcome::Completed { total_size: 100 }));
    }

    #[tokio::test]
    async fn test_fetch_416_on_covered_unknown_total_completes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("range", "bytes=100-"))
            .respond_with(ResponseTemplate::new(416).insert_header("content-range", "bytes */100"))
            .mount(&server)
            .await;

        let (_dir, store, fetcher, mut transfer) = setup(&format!("{}/f", server.uri())).await;
        std::fs::write(&transfer.destination_path, body(100)).unwrap();
        transfer.completed_ranges.insert(0, 100);
        store.put(&transfer).await.unwrap();

        let outcome = fetcher
            .fetch(&transfer, &StopSignal::new(), &RecordingSink::default())
            .await;
        assert!(matches!(outcome, FetchOutcome::Completed { total_size: 100 }));
    }

    #[tokio::test]
    async fn test_fetch_404_fails_without_progress() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (_dir, _store, fetcher, transfer) = setup(&format!("{}/missing", server.uri())).await;
        let outcome = fetcher
            .fetch(&transfer, &StopSignal::new(), &RecordingSink::default())
            .await;

        match outcome {
            FetchOutcome::Failed {
                error,
                made_progress,
            } => {
                assert_eq!(error.class(), FailureClass::ClientError(404));
                assert!(!made_progress);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_rejects_non_http_source() {
        let (_dir, _store, fetcher, mut transfer) = setup("ftp://example.com/file").await;
        transfer.source = "ftp://example.com/file".to_string();

        let outcome = fetcher
            .fetch(&transfer, &StopSignal::new(), &RecordingSink::default())
            .await;
        assert!(matches!(
            outcome,
            FetchOutcome::Failed {
                error: FetchError::InvalidUrl { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_fetch_with_cancel_already_requested_is_cancelled() {
        let (_dir, _store, fetcher, transfer) = setup("http://127.0.0.1:9/never").await;
        let signal = StopSignal::new();
        signal.stop(StopReason::Cancel);

        let outcome = fetcher
            .fetch(&transfer, &signal, &RecordingSink::default())
            .await;
        assert!(matches!(outcome, FetchOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_fetch_detects_length_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 0-99/100")
                    .set_body_bytes(body(100)),
            )
            .mount(&server)
            .await;

        let (_dir, store, fetcher, mut transfer) = setup(&format!("{}/f", server.uri())).await;
        // Recorded total disagrees with what the server now reports.
        transfer.total_size = Some(50);
        store.put(&transfer).await.unwrap();

        let outcome = fetcher
            .fetch(&transfer, &StopSignal::new(), &RecordingSink::default())
            .await;
        assert!(matches!(
            outcome,
            FetchOutcome::Failed {
                error: FetchError::SizeMismatch { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_checkpoint_rides_out_a_locked_store() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body(800)))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let (store, fetcher) = contended_fetcher(CHECKPOINT_STORE_RETRIES).await;
        let path = reserve_destination(dir.path(), "f.bin").await.unwrap();
        let transfer = Transfer::new(format!("{}/f", server.uri()), "f.bin", path);
        store.put(&transfer).await.unwrap();

        let outcome = fetcher
            .fetch(&transfer, &StopSignal::new(), &RecordingSink::default())
            .await;

        assert!(matches!(outcome, FetchOutcome::Completed { total_size: 800 }));
        let stored = store.get(&transfer.id).await.unwrap().unwrap();
        assert!(stored.completed_ranges.covers(800));
    }

    #[tokio::test]
    async fn test_checkpoint_gives_up_when_store_stays_locked() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body(800)))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let (store, fetcher) = contended_fetcher(u32::MAX).await;
        let path = reserve_destination(dir.path(), "f.bin").await.unwrap();
        let transfer = Transfer::new(format!("{}/f", server.uri()), "f.bin", path);
        store.put(&transfer).await.unwrap();

        let outcome = fetcher
            .fetch(&transfer, &StopSignal::new(), &RecordingSink::default())
            .await;

        match outcome {
            FetchOutcome::Failed { error, .. } => {
                assert_eq!(error.class(), FailureClass::Internal);
                assert!(error.to_string().contains("database is locked"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failure_after_discarding_ranges_is_not_progress() {
        let server = MockServer::start().await;
        // Resumes are answered from byte 0, and the body is always short.
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 0-1999/2000")
                    .set_body_bytes(body(1500)),
            )
            .mount(&server)
            .await;

        let (_dir, store, fetcher, mut transfer) = setup(&format!("{}/f", server.uri())).await;

        let first = fetcher
            .fetch(&transfer, &StopSignal::new(), &RecordingSink::default())
            .await;
        assert!(matches!(
            first,
            FetchOutcome::Failed {
                error: FetchError::SizeMismatch { .. },
                made_progress: true
            }
        ));

        transfer = store.get(&transfer.id).await.unwrap().unwrap();
        assert_eq!(transfer.completed_ranges.covered_len(), 1500);

        let second = fetcher
            .fetch(&transfer, &StopSignal::new(), &RecordingSink::default())
            .await;
        assert!(matches!(
            second,
            FetchOutcome::Failed {
                error: FetchError::SizeMismatch { .. },
                made_progress: false
            }
        ));
    }
}
