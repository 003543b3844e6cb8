//! # Edge Cache
//!
//! Process-local TTL cache shielding the coordinator registry store. Holds
//! both individual coordinator records and the resolved healthy-list per
//! region. Entries are never served past their TTL, and any persisted
//! write invalidates every region list (coarse invalidation).

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::types::{CoordinatorId, CoordinatorRecord};

/// A cached value with its fetch time. Not authoritative; always
/// re-derivable from the backing store.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub fetched_at: Instant,
}

impl<T> CacheEntry<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            fetched_at: Instant::now(),
        }
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

pub struct EdgeCache {
    ttl: Duration,
    records: DashMap<CoordinatorId, CacheEntry<CoordinatorRecord>>,
    regions: DashMap<String, CacheEntry<Vec<CoordinatorRecord>>>,
}

impl EdgeCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: DashMap::new(),
            regions: DashMap::new(),
        }
    }

    /// Fresh cached record, or `None` (missing or past TTL).
    pub fn record(&self, id: &CoordinatorId) -> Option<CoordinatorRecord> {
        if let Some(entry) = self.records.get(id) {
            if entry.is_fresh(self.ttl) {
                return Some(entry.value.clone());
            }
            // Release the shard guard before removing the expired entry.
            drop(entry);
            self.records.remove(id);
        }
        None
    }

    pub fn put_record(&self, record: CoordinatorRecord) {
        self.records
            .insert(record.coordinator_id.clone(), CacheEntry::new(record));
    }

    /// Fresh cached healthy-list for a region, or `None`.
    pub fn region(&self, region: &str) -> Option<Vec<CoordinatorRecord>> {
        if let Some(entry) = self.regions.get(region) {
            if entry.is_fresh(self.ttl) {
                return Some(entry.value.clone());
            }
            drop(entry);
            self.regions.remove(region);
        }
        None
    }

    pub fn put_region(&self, region: &str, records: Vec<CoordinatorRecord>) {
        self.regions
            .insert(region.to_string(), CacheEntry::new(records));
    }

    /// Update one coordinator inside an already-cached region list without
    /// touching its fetch time. Used on suppressed writes so in-process
    /// reads see the fresh record even though the store was not written.
    pub fn patch_region(&self, record: &CoordinatorRecord) {
        if let Some(mut entry) = self.regions.get_mut(&record.region) {
            for cached in entry.value.iter_mut() {
                if cached.coordinator_id == record.coordinator_id {
                    *cached = record.clone();
                    return;
                }
            }
        }
    }

    /// Coarse invalidation after a persisted write: every region list is
    /// dropped, not just the written coordinator's.
    pub fn invalidate_regions(&self) {
        let count = self.regions.len();
        self.regions.clear();
        if count > 0 {
            debug!(invalidated = count, "Region list cache invalidated");
        }
    }

    /// Drop entries past their TTL. Called from the edge sweep task.
    pub fn cleanup_expired(&self) {
        self.records.retain(|_, entry| entry.is_fresh(self.ttl));
        self.regions.retain(|_, entry| entry.is_fresh(self.ttl));
    }

    pub fn len(&self) -> usize {
        self.records.len() + self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
