//! Per-task progress reporting and speed estimation.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::events::{EventBus, TransferEvent};
use crate::fetch::{ProgressSink, StopReason, StopSignal};
use crate::store::TransferId;

/// Weight of the newest sample in the moving average.
const SMOOTHING_FACTOR: f64 = 0.3;

/// Samples shorter than this are accumulated into the next one.
const MIN_SAMPLE: Duration = Duration::from_millis(200);

/// Exponentially weighted moving average of throughput.
#[derive(Debug, Clone)]
pub(crate) struct SpeedMeter {
    estimate: f64,
    pending_bytes: u64,
    window_start: Instant,
    primed: bool,
}

impl SpeedMeter {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            estimate: 0.0,
            pending_bytes: 0,
            window_start: now,
            primed: false,
        }
    }

    /// Adds `bytes` observed at `now`; returns the current estimate in bytes/s.
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn record(&mut self, bytes: u64, now: Instant) -> f64 {
        self.pending_bytes += bytes;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < MIN_SAMPLE {
            return self.estimate;
        }

        let sample = self.pending_bytes as f64 / elapsed.as_secs_f64();
        self.estimate = if self.primed {
            SMOOTHING_FACTOR * sample + (1.0 - SMOOTHING_FACTOR) * self.estimate
        } else {
            sample
        };
        self.primed = true;
        self.pending_bytes = 0;
        self.window_start = now;
        self.estimate
    }
}

/// Publishes progress events for one running transfer.
///
/// Once a cancel has been requested nothing more is published.
pub(crate) struct ProgressReporter {
    id: TransferId,
    bus: EventBus,
    signal: StopSignal,
    meter: Mutex<SpeedMeter>,
}

impl ProgressReporter {
    pub(crate) fn new(id: TransferId, bus: EventBus, signal: StopSignal) -> Self {
        Self {
            id,
            bus,
            signal,
            meter: Mutex::new(SpeedMeter::new(Instant::now())),
        }
    }
}

impl ProgressSink for ProgressReporter {
    fn on_progress(&self, completed_bytes: u64, total_size: Option<u64>, delta: u64) -> f64 {
        let speed = self
            .meter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(delta, Instant::now());

        if self.signal.reason() != Some(StopReason::Cancel) {
            self.bus.publish(TransferEvent::Progress {
                id: self.id.clone(),
                completed_bytes,
                total_size,
                speed,
            });
        }
        speed
    }
}
