//! Change detection for the active partition.
//!
//! A single polling task compares the partition's version marker against
//! the last one it saw and asks the hub to publish a recomputation when it
//! differs. A change of partition key (day rollover, line rename) counts as
//! a change even if the markers happen to match.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::hub::StreamHub;
use crate::models::PartitionKey;
use crate::partition::PartitionVersion;

pub struct ChangeWatcher {
    hub: Arc<StreamHub>,
    interval: Duration,
    last: Option<(PartitionKey, PartitionVersion)>,
}

impl ChangeWatcher {
    pub fn new(hub: Arc<StreamHub>, interval: Duration) -> Self {
        Self {
            hub,
            interval,
            last: None,
        }
    }

    /// Polls forever at the configured interval.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.poll_once().await;
        }
    }

    /// One poll cycle. Returns whether new feeds were published.
    ///
    /// A failed or slow read counts as "no change"; the marker is not
    /// advanced, so the next cycle tries again.
    pub async fn poll_once(&mut self) -> bool {
        let service = self.hub.service().clone();
        let key = service.current_key();

        let probe_key = key.clone();
        let probe = tokio::task::spawn_blocking(move || service.store().version(&probe_key));
        let version = match tokio::time::timeout(self.interval, probe).await {
            Ok(Ok(Ok(version))) => version,
            Ok(Ok(Err(e))) => {
                warn!(partition = %key, error = %e, "partition version check failed");
                return false;
            }
            Ok(Err(e)) => {
                warn!(partition = %key, error = %e, "partition version task failed");
                return false;
            }
            Err(_) => {
                warn!(partition = %key, "partition version check timed out");
                return false;
            }
        };

        let observed = (key, version);
        if self.last.as_ref() == Some(&observed) {
            return false;
        }

        let service = self.hub.service().clone();
        let recompute = tokio::task::spawn_blocking(move || service.compute());
        let feeds = match tokio::time::timeout(self.interval, recompute).await {
            Ok(Ok(Ok(feeds))) => feeds,
            Ok(Ok(Err(e))) => {
                warn!(partition = %observed.0, error = %e, "metrics recompute failed");
                return false;
            }
            Ok(Err(e)) => {
                warn!(partition = %observed.0, error = %e, "metrics recompute task failed");
                return false;
            }
            Err(_) => {
                warn!(partition = %observed.0, "metrics recompute timed out");
                return false;
            }
        };

        debug!(partition = %observed.0, count = feeds.overall.count, "partition changed");
        self.hub.publish(feeds);
        self.last = Some(observed);
        true
    }
}
