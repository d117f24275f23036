//! Retry logic with exponential backoff for failed fetch attempts.
//!
//! The [`RetryPolicy`] looks at the [`FailureClass`] of an attempt and how
//! many attempts have failed so far, and answers with a [`RetryDecision`].
//!
//! | Class | Retried |
//! |-------|---------|
//! | `Network` | yes |
//! | `ServerError(5xx)` | yes |
//! | `ClientError(408 / 429)` | yes |
//! | other `ClientError` | no |
//! | `SizeMismatch` | once |
//! | `DiskWrite`, `InvalidUrl`, `Internal` | no |
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use transfer_core::fetch::FailureClass;
//! use transfer_core::retry::{RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::default().without_jitter();
//! match policy.should_retry(1, FailureClass::ServerError(503), None) {
//!     RetryDecision::Retry { delay } => assert_eq!(delay, Duration::from_secs(1)),
//!     RetryDecision::DoNotRetry { reason } => panic!("{reason}"),
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use crate::fetch::{FailureClass, MAX_RETRY_AFTER};

/// Default maximum attempts, including the first one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default base delay for exponential backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default maximum jitter added to delays.
pub const DEFAULT_JITTER: Duration = Duration::from_millis(250);

/// Size mismatches are retried at most this many times.
const SIZE_MISMATCH_RETRIES: u32 = 1;

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given delay.
    Retry {
        /// How long to wait before requeueing.
        delay: Duration,
    },

    /// Do not retry; the failure is terminal.
    DoNotRetry {
        /// Human-readable reason.
        reason: String,
    },
}

/// Exponential backoff configuration.
///
/// ```text
/// delay = min(base_delay * 2^(attempt - 1), max_delay) + jitter
/// ```
///
/// With defaults, delays are roughly 1s, 2s, 4s, 8s before the fifth failure
/// becomes terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with custom settings.
    ///
    /// `max_attempts` is clamped to at least 1.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter,
        }
    }

    /// Creates a policy with a custom `max_attempts`, using defaults otherwise.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Returns the same policy with jitter disabled.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = Duration::ZERO;
        self
    }

    /// Maximum attempts, including the first one.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides whether to retry.
    ///
    /// `attempt` is the 1-based count of failed attempts, including the one
    /// just observed. `retry_after` is a server-requested minimum delay.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(
        &self,
        attempt: u32,
        class: FailureClass,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        let attempt = attempt.max(1);
        match class {
            FailureClass::Network
            | FailureClass::ServerError(_)
            | FailureClass::ClientError(408 | 429) => {}
            FailureClass::ClientError(code) => {
                return RetryDecision::DoNotRetry {
                    reason: format!("HTTP {code} will not succeed on retry"),
                };
            }
            FailureClass::SizeMismatch => {
                if attempt > SIZE_MISMATCH_RETRIES {
                    return RetryDecision::DoNotRetry {
                        reason: "size mismatch persisted after retry".to_string(),
                    };
                }
            }
            FailureClass::DiskWrite => {
                return RetryDecision::DoNotRetry {
                    reason: "local write failure".to_string(),
                };
            }
            FailureClass::InvalidUrl => {
                return RetryDecision::DoNotRetry {
                    reason: "invalid URL".to_string(),
                };
            }
            FailureClass::Internal => {
                return RetryDecision::DoNotRetry {
                    reason: "internal error".to_string(),
                };
            }
        }

        if attempt >= self.max_attempts {
            debug!(attempt, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let mut delay = self.calculate_delay(attempt);
        if let Some(requested) = retry_after {
            delay = delay.max(requested.min(MAX_RETRY_AFTER));
        }

        debug!(attempt, delay_ms = delay.as_millis(), "will retry");
        RetryDecision::Retry { delay }
    }

    /// Backoff for the given 1-based attempt, capped, plus jitter.
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        let backoff = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        backoff + self.calculate_jitter()
    }

    fn calculate_jitter(&self) -> Duration {
        let max_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}
