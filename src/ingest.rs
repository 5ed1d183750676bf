//! Ingestion pipeline orchestration.
//!
//! Coordinates the per-scan flow: decode → rollover check → dedup → append.
//! One pipeline serves one line and processes tokens strictly in arrival
//! order; there is no internal parallelism.
//!
//! Day rollover is checked before every token and on every idle wakeup, so a
//! scan arriving at midnight lands in the new day's partition. A rollover
//! also reloads the configuration snapshot.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{Config, ConfigStore};
use crate::decoder::ScanDecoder;
use crate::dedup::DedupIndex;
use crate::error::TallyResult;
use crate::models::{PartitionKey, ScanRecord, ScanToken};
use crate::partition::PartitionStore;
use crate::source::{EventSource, SourceEvent};

/// Result of ingesting one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The token was new for today and has been durably appended.
    Appended(ScanRecord),
    /// The token was already recorded today and was discarded.
    Duplicate(ScanToken),
}

/// Counters reported when the ingest loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub appended: u64,
    pub duplicates: u64,
    pub rollovers: u64,
}

pub struct IngestPipeline {
    configs: Arc<ConfigStore>,
    config: Arc<Config>,
    store: PartitionStore,
    index: DedupIndex,
    clock: Arc<dyn Clock>,
    stats: IngestStats,
}

impl IngestPipeline {
    /// Opens (or creates) today's partition and loads its dedup index.
    pub fn open(configs: Arc<ConfigStore>, clock: Arc<dyn Clock>) -> TallyResult<Self> {
        let config = configs.snapshot();
        let store = PartitionStore::new(config.storage.data_dir.clone());
        let key = PartitionKey::new(config.line.name.clone(), clock.now().date());
        let index = load_index(&store, key)?;
        info!(
            partition = %index.key(),
            known = index.len(),
            "ingest pipeline ready"
        );
        Ok(Self {
            configs,
            config,
            store,
            index,
            clock,
            stats: IngestStats::default(),
        })
    }

    pub fn partition(&self) -> &PartitionKey {
        self.index.key()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &PartitionStore {
        &self.store
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Processes one decoded token.
    ///
    /// On a storage failure the index is left untouched, so the same token
    /// is not mistaken for a duplicate on retry.
    pub fn ingest(&mut self, token: ScanToken) -> TallyResult<IngestOutcome> {
        let now = self.clock.now();
        self.roll_to(now.date())?;

        if self.index.contains(&token) {
            self.stats.duplicates += 1;
            info!(token = %token, partition = %self.index.key(), "duplicate scan discarded");
            return Ok(IngestOutcome::Duplicate(token));
        }

        let record = ScanRecord {
            line_id: self.index.key().line_id.clone(),
            timestamp: now,
            token,
        };
        self.store.append(&record)?;
        self.index.insert(record.token.clone());
        self.stats.appended += 1;
        info!(token = %record.token, partition = %self.index.key(), "scan recorded");
        Ok(IngestOutcome::Appended(record))
    }

    /// Rolls over to a new partition if the calendar date has changed.
    /// Returns whether a rollover happened.
    pub fn check_rollover(&mut self) -> TallyResult<bool> {
        let today = self.clock.now().date();
        self.roll_to(today)
    }

    fn roll_to(&mut self, date: NaiveDate) -> TallyResult<bool> {
        if date == self.index.key().date {
            return Ok(false);
        }

        let config = match self.configs.reload() {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "config reload failed at rollover; keeping previous snapshot");
                self.config.clone()
            }
        };
        let key = PartitionKey::new(config.line.name.clone(), date);
        let index = load_index(&self.store, key)?;

        info!(
            from = %self.index.key(),
            to = %index.key(),
            known = index.len(),
            "day rollover"
        );
        self.config = config;
        self.index = index;
        self.stats.rollovers += 1;
        Ok(true)
    }
}

fn load_index(store: &PartitionStore, key: PartitionKey) -> TallyResult<DedupIndex> {
    store.open_or_create(&key)?;
    let records = store.read_all(&key)?;
    Ok(DedupIndex::from_records(key, &records))
}

/// Runs the ingest loop until the source closes, `shutdown` resolves, or a
/// device or storage error ends it.
///
/// Every append is synced before it is acknowledged, so there is nothing
/// buffered to flush on shutdown beyond an unterminated partial frame,
/// which is dropped.
pub async fn run_ingest<F>(
    pipeline: &mut IngestPipeline,
    source: &mut dyn EventSource,
    idle: Duration,
    shutdown: F,
) -> TallyResult<IngestStats>
where
    F: Future<Output = ()>,
{
    let mut decoder = ScanDecoder::new();
    tokio::pin!(shutdown);

    info!(source = source.name(), partition = %pipeline.partition(), "listening for scans");
    loop {
        let event = tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            event = source.next_event(idle) => event?,
        };

        match event {
            SourceEvent::Data(bytes) => {
                for token in decoder.feed(&bytes) {
                    debug!(token = %token, "decoded scan");
                    pipeline.ingest(token)?;
                }
            }
            SourceEvent::Idle => {
                pipeline.check_rollover()?;
            }
            SourceEvent::Closed => {
                info!(source = source.name(), "scan source closed");
                break;
            }
        }
    }

    if decoder.pending() > 0 {
        warn!(bytes = decoder.pending(), "dropping unterminated frame");
    }
    let stats = pipeline.stats();
    info!(
        appended = stats.appended,
        duplicates = stats.duplicates,
        rollovers = stats.rollovers,
        "ingest loop stopped"
    );
    Ok(stats)
}
