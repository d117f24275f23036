//! Shared helpers for integration tests.

#![allow(dead_code)]

pub mod range_server;
pub mod socket_guard;

use std::path::Path;
use std::time::Duration;

use transfer_core::{EngineConfig, RetryConfig, Subscription, TransferEvent, TransferId, TransferStatus};

/// Upper bound on any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(10);

/// Deterministic payload of `len` bytes.
pub fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Engine config rooted in `dir` with small chunks, frequent checkpoints and
/// fast retries.
pub fn test_config(dir: &Path, max_concurrent: usize) -> EngineConfig {
    EngineConfig {
        destination_dir: dir.join("out"),
        database_path: dir.join("transfers.db"),
        max_concurrent,
        chunk_size: 1024,
        checkpoint_interval_ms: 50,
        checkpoint_bytes: 4096,
        stall_timeout_secs: 5,
        connect_timeout_secs: 5,
        retry: RetryConfig {
            max_attempts: 3,
            base_delay_ms: 20,
            max_delay_ms: 1000,
            jitter_ms: 0,
        },
        ..EngineConfig::default()
    }
}

/// Receives events until `predicate` matches one, returning it.
pub async fn wait_for_event<F>(events: &mut Subscription, mut predicate: F) -> TransferEvent
where
    F: FnMut(&TransferEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event bus closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Waits until `id` moves into `status`.
pub async fn wait_for_status(
    events: &mut Subscription,
    id: &TransferId,
    status: TransferStatus,
) -> TransferEvent {
    wait_for_event(events, |event| {
        matches!(event, TransferEvent::StatusChanged { id: got, to, .. } if got == id && *to == status)
    })
    .await
}

/// Waits until `id` has at least `bytes` on disk.
pub async fn wait_for_progress(events: &mut Subscription, id: &TransferId, bytes: u64) {
    wait_for_event(events, |event| {
        matches!(event, TransferEvent::Progress { id: got, completed_bytes, .. } if got == id && *completed_bytes >= bytes)
    })
    .await;
}
