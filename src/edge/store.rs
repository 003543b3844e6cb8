//! # Coordinator Registry Store
//!
//! The strongly-consistent key-value contract behind the edge router:
//! upsert on coordinator announcement, list by region with read-time
//! staleness filtering, background deletion of long-dead records.
//!
//! The reference deployment backs this with a paid, rate-limited store, so
//! read/write counts are part of the contract; the in-memory
//! implementation tracks them and the budget tests assert on them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::types::{CoordinatorId, CoordinatorRecord, TidepoolResult};

#[async_trait]
pub trait CoordinatorStore: Send + Sync {
    /// Idempotent upsert keyed by `coordinator_id`. Concurrent writers for
    /// different coordinators never conflict; same-key writes are
    /// last-write-wins, which is safe because each coordinator only writes
    /// its own record.
    async fn put(&self, record: CoordinatorRecord) -> TidepoolResult<()>;

    /// Records for a region with `last_seen > min_last_seen`. Staleness is
    /// a read-time filter; dead records linger until the sweep.
    async fn list(&self, region: &str, min_last_seen: u64) -> TidepoolResult<Vec<CoordinatorRecord>>;

    /// Delete records with `last_seen < older_than`; returns how many.
    async fn sweep(&self, older_than: u64) -> TidepoolResult<usize>;
}

/// Operation counters exposed for budget assertions and the edge stats
/// endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreCounters {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
}

/// In-memory reference implementation.
pub struct MemoryStore {
    records: RwLock<HashMap<CoordinatorId, CoordinatorRecord>>,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    pub fn counters(&self) -> StoreCounters {
        StoreCounters {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinatorStore for MemoryStore {
    async fn put(&self, record: CoordinatorRecord) -> TidepoolResult<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.records
            .write()
            .await
            .insert(record.coordinator_id.clone(), record);
        Ok(())
    }

    async fn list(
        &self,
        region: &str,
        min_last_seen: u64,
    ) -> TidepoolResult<Vec<CoordinatorRecord>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let records = self.records.read().await;
        let mut matching: Vec<CoordinatorRecord> = records
            .values()
            .filter(|r| r.region == region && r.last_seen > min_last_seen)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.coordinator_id.as_str().cmp(b.coordinator_id.as_str()));
        Ok(matching)
    }

    async fn sweep(&self, older_than: u64) -> TidepoolResult<usize> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| r.last_seen >= older_than);
        let removed = before - records.len();
        if removed > 0 {
            self.deletes.fetch_add(removed as u64, Ordering::Relaxed);
            info!(removed, "Store sweep deleted dead coordinator records");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, region: &str, last_seen: u64) -> CoordinatorRecord {
        CoordinatorRecord {
            coordinator_id: CoordinatorId::from(id),
            endpoint: format!("http://{}.local:8080", id),
            region: region.to_string(),
            last_seen,
        }
    }

    #[tokio::test]
    async fn test_put_is_upsert() {
        let store = MemoryStore::new();
        store.put(record("coord-1", "eu", 100)).await.unwrap();
        store.put(record("coord-1", "eu", 200)).await.unwrap();

        let listed = store.list("eu", 0).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].last_seen, 200);
        assert_eq!(store.counters().writes, 2);
    }

    #[tokio::test]
    async fn test_list_filters_region_and_staleness() {
        let store = MemoryStore::new();
        store.put(record("coord-1", "eu", 100)).await.unwrap();
        store.put(record("coord-2", "eu", 500)).await.unwrap();
        store.put(record("coord-3", "us", 500)).await.unwrap();

        let listed = store.list("eu", 200).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].coordinator_id, CoordinatorId::from("coord-2"));
    }

    #[tokio::test]
    async fn test_stale_records_survive_list_until_sweep() {
        let store = MemoryStore::new();
        store.put(record("coord-1", "eu", 100)).await.unwrap();

        // Excluded from candidates but not deleted by the read.
        assert!(store.list("eu", 200).await.unwrap().is_empty());
        assert_eq!(store.list("eu", 0).await.unwrap().len(), 1);

        let removed = store.sweep(200).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.list("eu", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_counters_track_operations() {
        let store = MemoryStore::new();
        store.put(record("coord-1", "eu", 100)).await.unwrap();
        store.list("eu", 0).await.unwrap();
        store.list("eu", 0).await.unwrap();

        let counters = store.counters();
        assert_eq!(counters.writes, 1);
        assert_eq!(counters.reads, 2);
    }
}
