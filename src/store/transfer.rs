//! Transfer record types and status definitions.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::error::StoreError;
use super::ranges::RangeSet;

/// Opaque, stable identity of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransferId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TransferId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Waiting for a concurrency slot.
    Queued,
    /// Bytes are being fetched.
    Active,
    /// Stopped by the user; resumable.
    Paused,
    /// Every byte is on disk.
    Completed,
    /// Last attempt failed. Either waiting for an automatic retry or terminal.
    Failed,
    /// Stopped permanently by the user.
    Cancelled,
}

impl TransferStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Queued,
        Self::Active,
        Self::Paused,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true for states the lifecycle never leaves.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Returns true if the state machine allows moving from `self` to `next`.
    ///
    /// `Active -> Queued` is only taken by engine shutdown and crash recovery.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use TransferStatus::{Active, Cancelled, Completed, Failed, Paused, Queued};

        match (self, next) {
            (Queued, Active | Paused | Cancelled)
            | (Active, Completed | Paused | Failed | Cancelled | Queued)
            | (Paused, Queued | Cancelled)
            | (Failed, Queued | Paused | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid transfer status: {s}")),
        }
    }
}

/// One user-requested download.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transfer {
    /// Stable identity.
    pub id: TransferId,
    /// Source URL.
    pub source: String,
    /// File name component of the destination.
    pub file_name: String,
    /// Absolute path the bytes are written to.
    pub destination_path: PathBuf,
    /// Content type reported by the server, once known.
    pub mime_type: Option<String>,
    /// Total length in bytes, once known.
    pub total_size: Option<u64>,
    /// Byte ranges already written and flushed.
    pub completed_ranges: RangeSet,
    /// Lifecycle state.
    pub status: TransferStatus,
    /// Failed attempts since the last success or user action.
    pub attempt: u32,
    /// Description of the last failure.
    pub last_error: Option<String>,
    /// Smoothed throughput in bytes per second.
    pub speed_estimate: f64,
    /// When the transfer was submitted.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
    /// When the transfer completed.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Transfer {
    /// Creates a freshly submitted, queued transfer.
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        file_name: impl Into<String>,
        destination_path: impl Into<PathBuf>,
    ) -> Self {
        let now = now_millis_precision();
        Self {
            id: TransferId::generate(),
            source: source.into(),
            file_name: file_name.into(),
            destination_path: destination_path.into(),
            mime_type: None,
            total_size: None,
            completed_ranges: RangeSet::new(),
            status: TransferStatus::Queued,
            attempt: 0,
            last_error: None,
            speed_estimate: 0.0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Bytes already on disk.
    #[must_use]
    pub fn completed_bytes(&self) -> u64 {
        self.completed_ranges.covered_len()
    }

    /// Completion percentage, when the total size is known.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn progress_percent(&self) -> Option<f64> {
        match self.total_size {
            Some(0) => Some(100.0),
            Some(total) => Some(self.completed_bytes() as f64 / total as f64 * 100.0),
            None => None,
        }
    }
}

impl fmt::Display for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transfer {{ id: {}, source: {}, status: {} }}",
            self.id, self.source, self.status
        )
    }
}

/// Current time truncated to the millisecond precision stored in the database.
pub(crate) fn now_millis_precision() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis())
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// Raw database row; converted into [`Transfer`] with validation.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct TransferRow {
    pub id: String,
    pub source: String,
    pub file_name: String,
    pub destination_path: String,
    pub mime_type: Option<String>,
    pub total_size: Option<i64>,
    pub completed_ranges: String,
    pub status: String,
    pub attempt: i64,
    pub last_error: Option<String>,
    pub speed_estimate: f64,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

impl TryFrom<TransferRow> for Transfer {
    type Error = StoreError;

    fn try_from(row: TransferRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<TransferStatus>()
            .map_err(|reason| StoreError::corrupt(&row.id, reason))?;
        let completed_ranges: RangeSet = serde_json::from_str(&row.completed_ranges)
            .map_err(|e| StoreError::corrupt(&row.id, format!("invalid completed_ranges: {e}")))?;
        let total_size = row
            .total_size
            .map(u64::try_from)
            .transpose()
            .map_err(|_| StoreError::corrupt(&row.id, "negative total_size"))?;

        Ok(Self {
            id: TransferId(row.id),
            source: row.source,
            file_name: row.file_name,
            destination_path: PathBuf::from(row.destination_path),
            mime_type: row.mime_type,
            total_size,
            completed_ranges,
            status,
            attempt: u32::try_from(row.attempt).unwrap_or(u32::MAX),
            last_error: row.last_error,
            speed_estimate: row.speed_estimate,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
            completed_at: row.completed_at.map(from_millis),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_round_trip() {
        for status in TransferStatus::ALL {
            assert_eq!(status.as_str().parse::<TransferStatus>().unwrap(), status);
            assert_eq!(status.to_string(), status.as_str());
        }
        assert!("downloading".parse::<TransferStatus>().is_err());
    }

    #[test]
    fn test_state_machine_allows_documented_edges() {
        use TransferStatus::*;

        assert!(Queued.can_transition_to(Active));
        assert!(Active.can_transition_to(Paused));
        assert!(Active.can_transition_to(Completed));
        assert!(Paused.can_transition_to(Queued));
        assert!(Failed.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(Failed.can_transition_to(Cancelled));
    }

    #[test]
    fn test_state_machine_rejects_leaving_terminal_states() {
        use TransferStatus::*;

        for next in TransferStatus::ALL {
            assert!(!Completed.can_transition_to(next));
            assert!(!Cancelled.can_transition_to(next));
        }
        assert!(!Paused.can_transition_to(Active));
        assert!(!Queued.can_transition_to(Completed));
    }

    #[test]
    fn test_new_transfer_is_queued_with_unique_id() {
        let a = Transfer::new("https://example.com/a.bin", "a.bin", "/tmp/a.bin");
        let b = Transfer::new("https://example.com/a.bin", "a.bin", "/tmp/a.bin");
        assert_eq!(a.status, TransferStatus::Queued);
        assert_eq!(a.attempt, 0);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_progress_percent() {
        let mut transfer = Transfer::new("https://example.com/a", "a", "/tmp/a");
        assert_eq!(transfer.progress_percent(), None);

        transfer.total_size = Some(200);
        transfer.completed_ranges.insert(0, 50);
        assert_eq!(transfer.progress_percent(), Some(25.0));
    }

    #[test]
    fn test_row_with_bad_status_is_corrupt() {
        let row = TransferRow {
            id: "x".to_string(),
            source: "https://example.com".to_string(),
            file_name: "f".to_string(),
            destination_path: "/tmp/f".to_string(),
            mime_type: None,
            total_size: None,
            completed_ranges: "[]".to_string(),
            status: "bogus".to_string(),
            attempt: 0,
            last_error: None,
            speed_estimate: 0.0,
            created_at: 0,
            updated_at: 0,
            completed_at: None,
        };
        let result = Transfer::try_from(row);
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }
}
