//! Ordered, non-overlapping sets of completed byte ranges.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A half-open byte interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "(u64, u64)", into = "(u64, u64)")]
pub struct ByteRange {
    /// First byte offset (inclusive).
    pub start: u64,
    /// One past the last byte offset (exclusive).
    pub end: u64,
}

impl ByteRange {
    /// Creates a range; `end` is clamped so the range is never inverted.
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    /// Number of bytes covered.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Returns true if the range covers no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl From<(u64, u64)> for ByteRange {
    fn from((start, end): (u64, u64)) -> Self {
        Self::new(start, end)
    }
}

impl From<ByteRange> for (u64, u64) {
    fn from(range: ByteRange) -> Self {
        (range.start, range.end)
    }
}

/// A region of the resource that still has to be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    /// First missing byte.
    pub start: u64,
    /// End of the gap (exclusive); `None` when it runs to the end of the resource.
    pub end: Option<u64>,
}

impl Gap {
    /// Renders the gap as an HTTP `Range` header value.
    #[must_use]
    pub fn to_header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end.saturating_sub(1)),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// Set of completed byte ranges.
///
/// Ranges are kept sorted by start offset; overlapping or adjacent inserts
/// are merged, so the stored ranges never overlap or touch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<ByteRange>", into = "Vec<ByteRange>")]
pub struct RangeSet {
    ranges: Vec<ByteRange>,
}

impl From<Vec<ByteRange>> for RangeSet {
    fn from(ranges: Vec<ByteRange>) -> Self {
        let mut set = Self::new();
        for range in ranges {
            set.insert(range.start, range.end);
        }
        set
    }
}

impl From<RangeSet> for Vec<ByteRange> {
    fn from(set: RangeSet) -> Self {
        set.ranges
    }
}

impl RangeSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no bytes are covered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Iterates ranges in offset order.
    pub fn iter(&self) -> impl Iterator<Item = &ByteRange> {
        self.ranges.iter()
    }

    /// Number of disjoint ranges.
    #[must_use]
    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    /// Marks `[start, end)` as completed, merging with neighbours.
    pub fn insert(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }

        let mut merged = ByteRange { start, end };
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;

        for range in self.ranges.drain(..) {
            if range.end < merged.start {
                out.push(range);
            } else if range.start > merged.end {
                if !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push(range);
            } else {
                merged.start = merged.start.min(range.start);
                merged.end = merged.end.max(range.end);
            }
        }
        if !placed {
            out.push(merged);
        }

        self.ranges = out;
    }

    /// Removes every range.
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Total number of bytes covered.
    #[must_use]
    pub fn covered_len(&self) -> u64 {
        self.ranges.iter().map(ByteRange::len).sum()
    }

    /// Highest covered offset (exclusive), or 0 when empty.
    #[must_use]
    pub fn max_end(&self) -> u64 {
        self.ranges.last().map_or(0, |range| range.end)
    }

    /// Returns true if `[0, total)` is fully covered.
    #[must_use]
    pub fn covers(&self, total: u64) -> bool {
        match self.ranges.as_slice() {
            [] => total == 0,
            [only] => only.start == 0 && only.end >= total,
            _ => false,
        }
    }

    /// Returns the first region that still needs to be fetched.
    ///
    /// With a known `total`, returns `None` once everything is covered. With
    /// an unknown total there is always an open-ended trailing gap.
    #[must_use]
    pub fn first_gap(&self, total: Option<u64>) -> Option<Gap> {
        let mut cursor = 0;
        for range in &self.ranges {
            if range.start > cursor {
                return Some(Gap {
                    start: cursor,
                    end: Some(range.start),
                });
            }
            cursor = range.end;
        }

        match total {
            Some(total) if cursor >= total => None,
            _ => Some(Gap {
                start: cursor,
                end: None,
            }),
        }
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .ranges
            .iter()
            .map(|range| format!("[{}, {})", range.start, range.end))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}
