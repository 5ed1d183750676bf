//! In-memory duplicate index for one partition.
//!
//! Built once from the partition's records when the partition becomes
//! active, then kept current by inserting each token right after its
//! append succeeds. Never persisted: it can always be rebuilt from the
//! partition file.

use std::collections::HashSet;

use crate::models::{PartitionKey, ScanRecord, ScanToken};

#[derive(Debug, Clone)]
pub struct DedupIndex {
    key: PartitionKey,
    seen: HashSet<ScanToken>,
}

impl DedupIndex {
    pub fn empty(key: PartitionKey) -> Self {
        Self {
            key,
            seen: HashSet::new(),
        }
    }

    /// Builds the index by replaying a partition's records.
    pub fn from_records<'a>(
        key: PartitionKey,
        records: impl IntoIterator<Item = &'a ScanRecord>,
    ) -> Self {
        let mut index = Self::empty(key);
        for record in records {
            index.seen.insert(record.token.clone());
        }
        index
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub fn contains(&self, token: &ScanToken) -> bool {
        self.seen.contains(token)
    }

    /// Returns `false` if the token was already present.
    pub fn insert(&mut self, token: ScanToken) -> bool {
        self.seen.insert(token)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
