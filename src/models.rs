//! Core data models used throughout scan-tally.
//!
//! These types represent the scans, partitions, and metric snapshots that
//! flow through the ingest pipeline and the streaming layer.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp format used in partition files (`YYYY-MM-DD HH:MM:SS`).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Date format used in partition names.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Time-of-day format used by segment boundaries.
pub const SEGMENT_TIME_FORMAT: &str = "%H:%M";

/// Normalized scan payload, used as the dedup key within one partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScanToken(String);

impl ScanToken {
    /// Normalizes a raw payload: strips quote characters and surrounding
    /// whitespace. Returns `None` when nothing is left.
    pub fn normalize(raw: &str) -> Option<Self> {
        let cleaned: String = raw.chars().filter(|c| *c != '"' && *c != '\'').collect();
        let trimmed = cleaned.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScanToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One accepted scan. Immutable once appended to a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRecord {
    pub line_id: String,
    pub timestamp: NaiveDateTime,
    pub token: ScanToken,
}

/// Addresses one partition: a line on a calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub line_id: String,
    pub date: NaiveDate,
}

impl PartitionKey {
    pub fn new(line_id: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            line_id: line_id.into(),
            date,
        }
    }

    /// File name of the partition: `<YYYY-MM-DD>_<line>.csv`.
    pub fn file_name(&self) -> String {
        format!("{}_{}.csv", self.date.format(DATE_FORMAT), self.line_id)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.line_id, self.date.format(DATE_FORMAT))
    }
}

/// A configured time-of-day window with its own production target.
///
/// `start > end` encodes a window that wraps past midnight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSegment {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub target: u32,
}

impl TimeSegment {
    /// Whether a time-of-day falls inside this window (both ends inclusive).
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= t && t <= self.end
        } else {
            t >= self.start || t <= self.end
        }
    }

    /// Display label, e.g. `"08:00-16:00"`.
    pub fn label(&self) -> String {
        format!(
            "{}-{}",
            self.start.format(SEGMENT_TIME_FORMAT),
            self.end.format(SEGMENT_TIME_FORMAT)
        )
    }
}

/// Per-segment tally inside a [`MetricsSnapshot`].
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentCount {
    pub label: String,
    pub actual: u64,
    pub target: u32,
}

/// Derived, point-in-time progress computation. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub total_count: u64,
    pub total_percentage: f64,
    pub per_segment: Vec<SegmentCount>,
}

/// Segment echo in the segmented feed, in configuration form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentView {
    pub start: String,
    pub end: String,
    pub target: u32,
}

impl From<&TimeSegment> for SegmentView {
    fn from(seg: &TimeSegment) -> Self {
        Self {
            start: seg.start.format(SEGMENT_TIME_FORMAT).to_string(),
            end: seg.end.format(SEGMENT_TIME_FORMAT).to_string(),
            target: seg.target,
        }
    }
}

/// Payload of the overall feed (`/data`, `/stream`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverallFeed {
    pub count: u64,
    pub percentage: f64,
    pub line_name: String,
    pub target: u32,
}

/// Payload of the segmented feed (`/visual-data`, `/visual-stream`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentedFeed {
    pub labels: Vec<String>,
    pub actual_counts: Vec<u64>,
    pub target_counts: Vec<u32>,
    pub line_name: String,
    pub segments: Vec<SegmentView>,
}
