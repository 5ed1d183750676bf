//! Production-progress metrics.
//!
//! [`compute_snapshot`] is a pure function over a partition's records and
//! a configuration snapshot; it keeps no state and is recomputed from
//! scratch on every call. [`MetricsService`] binds it to the partition store
//! and the clock to produce the feeds served to dashboards.

use chrono::NaiveDate;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::{Config, ConfigStore};
use crate::error::TallyResult;
use crate::models::{
    MetricsSnapshot, OverallFeed, PartitionKey, ScanRecord, SegmentCount, SegmentView,
    SegmentedFeed, TimeSegment,
};
use crate::partition::PartitionStore;

/// `count / target * 100`, rounded to two decimals. A zero target means
/// "untracked" and always yields 0.
pub fn percentage(count: u64, target: u32) -> f64 {
    if target == 0 {
        return 0.0;
    }
    let raw = count as f64 / target as f64 * 100.0;
    (raw * 100.0).round() / 100.0
}

/// Computes progress for one partition.
///
/// Every record counts toward `total_count`. For segment totals only
/// records dated `date` are classified, each into the first segment whose
/// window contains its time of day; records outside every window count
/// toward no segment.
pub fn compute_snapshot(
    records: &[ScanRecord],
    date: NaiveDate,
    target: u32,
    segments: &[TimeSegment],
) -> MetricsSnapshot {
    let mut per_segment: Vec<SegmentCount> = segments
        .iter()
        .map(|seg| SegmentCount {
            label: seg.label(),
            actual: 0,
            target: seg.target,
        })
        .collect();

    for record in records.iter().filter(|r| r.timestamp.date() == date) {
        let t = record.timestamp.time();
        if let Some(idx) = segments.iter().position(|seg| seg.contains(t)) {
            per_segment[idx].actual += 1;
        }
    }

    let total_count = records.len() as u64;
    MetricsSnapshot {
        total_count,
        total_percentage: percentage(total_count, target),
        per_segment,
    }
}

/// Which feed a subscriber receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedKind {
    Overall,
    Segmented,
}

/// Both feed payloads for one recomputation, pre-encoded once so every
/// subscriber is sent identical bytes.
#[derive(Debug, Clone)]
pub struct FeedSet {
    pub partition: PartitionKey,
    pub overall: OverallFeed,
    pub segmented: SegmentedFeed,
    overall_json: String,
    segmented_json: String,
    overall_fingerprint: String,
    segmented_fingerprint: String,
}

impl FeedSet {
    pub fn new(partition: PartitionKey, config: &Config, snapshot: &MetricsSnapshot) -> Self {
        let overall = OverallFeed {
            count: snapshot.total_count,
            percentage: snapshot.total_percentage,
            line_name: config.line.name.clone(),
            target: config.line.target,
        };
        let segmented = SegmentedFeed {
            labels: snapshot.per_segment.iter().map(|s| s.label.clone()).collect(),
            actual_counts: snapshot.per_segment.iter().map(|s| s.actual).collect(),
            target_counts: snapshot.per_segment.iter().map(|s| s.target).collect(),
            line_name: config.line.name.clone(),
            segments: config.time_segments().iter().map(SegmentView::from).collect(),
        };
        // Plain structs of strings and numbers; encoding cannot fail.
        let overall_json = serde_json::to_string(&overall).unwrap_or_default();
        let segmented_json = serde_json::to_string(&segmented).unwrap_or_default();
        Self {
            partition,
            overall_fingerprint: fingerprint(&overall_json),
            segmented_fingerprint: fingerprint(&segmented_json),
            overall,
            segmented,
            overall_json,
            segmented_json,
        }
    }

    pub fn json(&self, kind: FeedKind) -> &str {
        match kind {
            FeedKind::Overall => &self.overall_json,
            FeedKind::Segmented => &self.segmented_json,
        }
    }

    pub fn fingerprint(&self, kind: FeedKind) -> &str {
        match kind {
            FeedKind::Overall => &self.overall_fingerprint,
            FeedKind::Segmented => &self.segmented_fingerprint,
        }
    }

    /// JSON value of one feed, for the pull endpoints.
    pub fn to_value(&self, kind: FeedKind) -> serde_json::Value {
        match kind {
            FeedKind::Overall => to_value(&self.overall),
            FeedKind::Segmented => to_value(&self.segmented),
        }
    }
}

fn to_value<T: Serialize>(v: &T) -> serde_json::Value {
    serde_json::to_value(v).unwrap_or(serde_json::Value::Null)
}

fn fingerprint(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

/// Computes feeds for the line's current partition.
pub struct MetricsService {
    configs: Arc<ConfigStore>,
    store: PartitionStore,
    clock: Arc<dyn Clock>,
}

impl MetricsService {
    pub fn new(configs: Arc<ConfigStore>, clock: Arc<dyn Clock>) -> Self {
        let store = PartitionStore::new(configs.snapshot().storage.data_dir.clone());
        Self {
            configs,
            store,
            clock,
        }
    }

    pub fn store(&self) -> &PartitionStore {
        &self.store
    }

    pub fn configs(&self) -> &Arc<ConfigStore> {
        &self.configs
    }

    /// The partition that is current right now for the configured line.
    pub fn current_key(&self) -> PartitionKey {
        let config = self.configs.snapshot();
        PartitionKey::new(config.line.name.clone(), self.clock.now().date())
    }

    /// Reads the current partition and recomputes both feeds.
    pub fn compute(&self) -> TallyResult<FeedSet> {
        let config = self.configs.snapshot();
        let key = PartitionKey::new(config.line.name.clone(), self.clock.now().date());
        let records = self.store.read_all(&key)?;
        let snapshot = compute_snapshot(
            &records,
            key.date,
            config.line.target,
            &config.time_segments(),
        );
        Ok(FeedSet::new(key, &config, &snapshot))
    }

    /// Like [`compute`](Self::compute), but falls back to the empty
    /// snapshot of the current partition when the read fails.
    pub fn compute_or_default(&self) -> FeedSet {
        match self.compute() {
            Ok(feeds) => feeds,
            Err(e) => {
                tracing::warn!(error = %e, "metrics read failed; serving empty snapshot");
                self.empty()
            }
        }
    }

    /// Zero-count feeds for the current partition.
    pub fn empty(&self) -> FeedSet {
        let config = self.configs.snapshot();
        let key = PartitionKey::new(config.line.name.clone(), self.clock.now().date());
        let snapshot = compute_snapshot(&[], key.date, config.line.target, &config.time_segments());
        FeedSet::new(key, &config, &snapshot)
    }
}
