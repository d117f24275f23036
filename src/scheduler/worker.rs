//! Spawning and supervising one fetch attempt.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{Instrument, error, info_span};

use super::Inner;
use super::progress::ProgressReporter;
use crate::fetch::{FetchError, FetchOutcome, StopSignal};
use crate::store::Transfer;

/// Runs `transfer` on its own task and reports the outcome to the scheduler.
///
/// `done` flips to `true` after the scheduler has applied the outcome, which
/// is what `pause`, `cancel` and `shutdown` wait on.
pub(super) fn spawn(
    inner: Arc<Inner>,
    transfer: Transfer,
    signal: StopSignal,
    done: watch::Sender<bool>,
) {
    let span = info_span!("transfer", id = %transfer.id);
    tokio::spawn(
        async move {
            let id = transfer.id.clone();
            let outcome = run_attempt(&inner, transfer, signal).await;
            inner.finish(&id, outcome).await;
            done.send_replace(true);
        }
        .instrument(span),
    );
}

/// Runs the fetch on a nested task so a panic becomes an `Internal` failure
/// instead of a lost slot.
async fn run_attempt(inner: &Inner, transfer: Transfer, signal: StopSignal) -> FetchOutcome {
    let fetcher = inner.fetcher.clone();
    let reporter = ProgressReporter::new(transfer.id.clone(), inner.bus.clone(), signal.clone());

    let handle =
        tokio::spawn(async move { fetcher.fetch(&transfer, &signal, &reporter).await }.in_current_span());

    match handle.await {
        Ok(outcome) => outcome,
        Err(join_error) => {
            error!(error = %join_error, "fetch task terminated abnormally");
            FetchOutcome::failed(FetchError::internal(format!(
                "fetch task terminated: {join_error}"
            )))
        }
    }
}
