//! Cooperative stop requests for an in-flight fetch.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio_util::sync::CancellationToken;

/// Why a fetch is being asked to stop.
///
/// Ordered by precedence: a later, stronger request overrides a weaker one
/// (a cancel issued after a pause still cancels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StopReason {
    /// User pause; keep progress.
    Pause = 1,
    /// Engine shutdown; keep progress, requeue on next start.
    Shutdown = 2,
    /// User cancel or removal; stop without further reports.
    Cancel = 3,
}

impl StopReason {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Pause),
            2 => Some(Self::Shutdown),
            3 => Some(Self::Cancel),
            _ => None,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pause => "pause",
            Self::Shutdown => "shutdown",
            Self::Cancel => "cancel",
        };
        f.write_str(label)
    }
}

/// Shared stop flag observed by the fetcher between reads.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
    reason: Arc<AtomicU8>,
}

impl StopSignal {
    /// Creates an unsignalled stop flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a stop. Keeps the strongest reason seen so far.
    pub fn stop(&self, reason: StopReason) {
        self.reason.fetch_max(reason as u8, Ordering::SeqCst);
        self.token.cancel();
    }

    /// Returns the stop reason, if a stop was requested.
    #[must_use]
    pub fn reason(&self) -> Option<StopReason> {
        StopReason::from_u8(self.reason.load(Ordering::SeqCst))
    }

    /// Returns true once a stop was requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when a stop is requested.
    pub async fn stopped(&self) {
        self.token.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_signal_is_clear() {
        let signal = StopSignal::new();
        assert!(!signal.is_stopped());
        assert_eq!(signal.reason(), None);
    }

    #[test]
    fn test_cancel_overrides_pause_but_not_reverse() {
        let signal = StopSignal::new();
        signal.stop(StopReason::Pause);
        assert_eq!(signal.reason(), Some(StopReason::Pause));

        signal.stop(StopReason::Cancel);
        assert_eq!(signal.reason(), Some(StopReason::Cancel));

        signal.stop(StopReason::Pause);
        assert_eq!(signal.reason(), Some(StopReason::Cancel));
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let signal = StopSignal::new();
        let observer = signal.clone();
        let waiter = tokio::spawn(async move {
            observer.stopped().await;
            observer.reason()
        });
        signal.stop(StopReason::Shutdown);
        assert_eq!(waiter.await.ok().flatten(), Some(StopReason::Shutdown));
    }
}
