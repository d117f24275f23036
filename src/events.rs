//! Fan-out of transfer lifecycle and progress events.
//!
//! Every subscriber owns a mailbox. Publishing never blocks and never fails:
//!
//! - lifecycle events (`Created`, `StatusChanged`, `Removed`) are always
//!   queued;
//! - progress events share a bounded capacity per subscriber, and when it is
//!   full the oldest queued progress event is discarded.
//!
//! A slow subscriber therefore sees every state change but may miss
//! intermediate progress samples. Dropping a [`Subscription`] unsubscribes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use futures_util::Stream;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::trace;

use crate::store::{Transfer, TransferId, TransferStatus};

/// Default number of progress events buffered per subscriber.
pub const DEFAULT_PROGRESS_CAPACITY: usize = 256;

/// An observable change to a transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransferEvent {
    /// A transfer was submitted.
    Created(Transfer),
    /// A transfer moved between lifecycle states.
    StatusChanged {
        /// Transfer id.
        id: TransferId,
        /// Previous state.
        from: TransferStatus,
        /// New state.
        to: TransferStatus,
        /// Failure description, for moves into `Failed`.
        error: Option<String>,
        /// Delay until the automatic retry, when one is scheduled.
        retry_in: Option<Duration>,
    },
    /// Bytes landed on disk.
    Progress {
        /// Transfer id.
        id: TransferId,
        /// Bytes on disk.
        completed_bytes: u64,
        /// Total length, once known.
        total_size: Option<u64>,
        /// Smoothed speed in bytes per second.
        speed: f64,
    },
    /// A transfer record was deleted.
    Removed {
        /// Transfer id.
        id: TransferId,
    },
}

impl TransferEvent {
    /// Id of the transfer the event is about.
    #[must_use]
    pub fn id(&self) -> &TransferId {
        match self {
            Self::Created(transfer) => &transfer.id,
            Self::StatusChanged { id, .. } | Self::Progress { id, .. } | Self::Removed { id } => id,
        }
    }

    /// Returns true for droppable progress samples.
    #[must_use]
    pub fn is_progress(&self) -> bool {
        matches!(self, Self::Progress { .. })
    }
}

#[derive(Debug, Default)]
struct MailboxQueue {
    events: VecDeque<TransferEvent>,
    progress_len: usize,
    closed: bool,
}

#[derive(Debug, Default)]
struct Mailbox {
    queue: Mutex<MailboxQueue>,
    notify: Notify,
    dropped: AtomicU64,
}

impl Mailbox {
    /// Queues an event; returns true if an old progress event was discarded.
    fn push(&self, event: TransferEvent, progress_capacity: usize) -> bool {
        let mut dropped = false;
        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if event.is_progress() {
                if queue.progress_len >= progress_capacity
                    && let Some(pos) = queue.events.iter().position(TransferEvent::is_progress)
                {
                    queue.events.remove(pos);
                    queue.progress_len -= 1;
                    dropped = true;
                }
                if progress_capacity > 0 {
                    queue.progress_len += 1;
                    queue.events.push_back(event);
                } else {
                    dropped = true;
                }
            } else {
                queue.events.push_back(event);
            }
        }
        if dropped {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        dropped
    }

    fn pop(&self) -> Option<TransferEvent> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let event = queue.events.pop_front()?;
        if event.is_progress() {
            queue.progress_len -= 1;
        }
        Some(event)
    }

    fn is_closed(&self) -> bool {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    fn close(&self) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.notify.notify_one();
    }
}

#[derive(Debug)]
struct BusInner {
    subscribers: Mutex<Vec<Weak<Mailbox>>>,
    progress_capacity: usize,
    dropped_progress: AtomicU64,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        let subscribers = self
            .subscribers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for mailbox in subscribers.iter().filter_map(Weak::upgrade) {
            mailbox.close();
        }
    }
}

/// Multi-subscriber event fan-out. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates a bus with the default progress capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_progress_capacity(DEFAULT_PROGRESS_CAPACITY)
    }

    /// Creates a bus that buffers at most `capacity` progress events per subscriber.
    #[must_use]
    pub fn with_progress_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                progress_capacity: capacity,
                dropped_progress: AtomicU64::new(0),
            }),
        }
    }

    /// Delivers `event` to every live subscriber.
    pub fn publish(&self, event: TransferEvent) {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|weak| weak.strong_count() > 0);
        trace!(id = %event.id(), subscribers = subscribers.len(), "publish");

        for mailbox in subscribers.iter().filter_map(Weak::upgrade) {
            if mailbox.push(event.clone(), self.inner.progress_capacity) {
                self.inner.dropped_progress.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Registers a subscriber that sees every event published from now on.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let mailbox = Arc::new(Mailbox::default());
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&mailbox));
        Subscription { mailbox }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Progress events discarded across all subscribers.
    #[must_use]
    pub fn dropped_progress(&self) -> u64 {
        self.inner.dropped_progress.load(Ordering::Relaxed)
    }
}

/// Receiving end of an [`EventBus`] subscription.
#[derive(Debug)]
pub struct Subscription {
    mailbox: Arc<Mailbox>,
}

impl Subscription {
    /// Waits for the next event.
    ///
    /// Returns `None` once every [`EventBus`] handle is gone and the mailbox
    /// is drained.
    pub async fn recv(&mut self) -> Option<TransferEvent> {
        loop {
            if let Some(event) = self.mailbox.pop() {
                return Some(event);
            }
            if self.mailbox.is_closed() {
                return None;
            }
            self.mailbox.notify.notified().await;
        }
    }

    /// Returns the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<TransferEvent> {
        self.mailbox.pop()
    }

    /// Progress events this subscriber missed.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.mailbox.dropped.load(Ordering::Relaxed)
    }

    /// Converts the subscription into a stream of events.
    pub fn into_stream(self) -> impl Stream<Item = TransferEvent> + Send {
        futures_util::stream::unfold(self, |mut subscription| async move {
            subscription
                .recv()
                .await
                .map(|event| (event, subscription))
        })
    }
}
