//! # Worker Registry
//!
//! In-memory worker registry and health state machine for a coordinator.
//! The registry is ephemeral by design: a coordinator restart wipes it and
//! recovery relies entirely on workers re-registering. Do not add
//! persistence here; the cost model of the edge layer depends on worker
//! state staying off any durable store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::types::{
    unix_now, Tier, TidepoolError, TidepoolResult, WorkerCapabilities, WorkerId,
};

/// Derived health of a worker. Never stored; always computed from
/// `now - last_heartbeat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Active,
    Stale,
    Expired,
}

/// One registered worker. Owned exclusively by this coordinator's registry;
/// mutated only by the worker's own registration and heartbeat calls, and
/// always replaced/updated as a whole under one write lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    pub tier: Tier,
    pub services: HashSet<String>,
    pub endpoint: String,
    pub capabilities: WorkerCapabilities,
    pub current_load: f64,
    pub cpu_percent: f64,
    pub loaded_models: HashSet<String>,
    /// Unix seconds of the last accepted heartbeat (or registration).
    pub last_heartbeat: u64,
    pub registered_at: u64,
}

impl WorkerRecord {
    /// Derive status at the given instant.
    pub fn status_at(&self, now: u64, stale_after: u64, expire_after: u64) -> WorkerStatus {
        let silent_for = now.saturating_sub(self.last_heartbeat);
        if silent_for > expire_after {
            WorkerStatus::Expired
        } else if silent_for > stale_after {
            WorkerStatus::Stale
        } else {
            WorkerStatus::Active
        }
    }
}

/// Registration input, already deserialized and validated at the API edge.
#[derive(Debug, Clone)]
pub struct Registration {
    pub worker_id: WorkerId,
    pub endpoint: String,
    pub services: Vec<String>,
    pub capabilities: WorkerCapabilities,
}

/// Tier assignment returned from registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierAssignment {
    pub tier: Tier,
    pub assigned_services: Vec<String>,
}

/// Load snapshot carried on a heartbeat.
#[derive(Debug, Clone)]
pub struct HeartbeatSnapshot {
    pub worker_id: WorkerId,
    /// Sender-side unix seconds. Applied monotonically: an older timestamp
    /// than the stored record is dropped.
    pub timestamp: u64,
    pub load: f64,
    pub cpu_percent: f64,
    pub loaded_models: HashSet<String>,
}

/// Worker view returned by diagnostics, with derived status attached.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerView {
    #[serde(flatten)]
    pub record: WorkerRecord,
    pub status: WorkerStatus,
    pub in_flight: usize,
}

/// Registry counters for the admin stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub total_workers: usize,
    pub active_workers: usize,
    pub stale_workers: usize,
    pub registrations: u64,
    pub heartbeats_accepted: u64,
    pub heartbeats_dropped_stale: u64,
    pub workers_expired: u64,
}

/// Each in-flight dispatch counts as this much extra load until the
/// worker's next heartbeat reports the real figure.
const DISPATCH_LOAD_SHARE: f64 = 0.1;

/// In-memory worker registry with derived health state.
pub struct WorkerRegistry {
    stale_after_secs: u64,
    expire_after_secs: u64,
    workers: RwLock<HashMap<WorkerId, WorkerRecord>>,
    in_flight: Arc<DashMap<WorkerId, usize>>,
    counters: RwLock<RegistryStats>,
}

impl WorkerRegistry {
    pub fn new(stale_after_secs: u64, expire_after_secs: u64) -> Self {
        Self {
            stale_after_secs,
            expire_after_secs,
            workers: RwLock::new(HashMap::new()),
            in_flight: Arc::new(DashMap::new()),
            counters: RwLock::new(RegistryStats::default()),
        }
    }

    /// Register a worker. Idempotent: re-registering an existing id
    /// overwrites its record and resets its heartbeat timer.
    pub async fn register(&self, registration: Registration) -> TidepoolResult<TierAssignment> {
        self.register_at(registration, unix_now()).await
    }

    pub(crate) async fn register_at(
        &self,
        registration: Registration,
        now: u64,
    ) -> TidepoolResult<TierAssignment> {
        let tier = registration.capabilities.assign_tier()?;

        let mut services: Vec<String> = registration.services;
        services.sort();
        services.dedup();

        let record = WorkerRecord {
            worker_id: registration.worker_id.clone(),
            tier,
            services: services.iter().cloned().collect(),
            endpoint: registration.endpoint,
            capabilities: registration.capabilities,
            current_load: 0.0,
            cpu_percent: 0.0,
            loaded_models: HashSet::new(),
            last_heartbeat: now,
            registered_at: now,
        };

        // Hold the write lock through insert so concurrent re-registration
        // of the same id cannot interleave with a heartbeat update.
        let mut workers = self.workers.write().await;
        let replaced = workers.insert(registration.worker_id.clone(), record).is_some();
        drop(workers);

        self.counters.write().await.registrations += 1;

        info!(
            worker_id = %registration.worker_id,
            tier = %tier,
            services = ?services,
            replaced,
            "Worker registered"
        );

        Ok(TierAssignment {
            tier,
            assigned_services: services,
        })
    }

    /// Apply a heartbeat. Returns `UnknownWorker` when the id has been
    /// purged (the caller must re-register) and `StaleHeartbeat` when the
    /// snapshot's timestamp is older than the stored record. The stored
    /// `last_heartbeat` never decreases.
    pub async fn heartbeat(&self, snapshot: HeartbeatSnapshot) -> TidepoolResult<()> {
        let mut workers = self.workers.write().await;
        let record = workers
            .get_mut(&snapshot.worker_id)
            .ok_or_else(|| TidepoolError::UnknownWorker(snapshot.worker_id.clone()))?;

        if snapshot.timestamp < record.last_heartbeat {
            let err = TidepoolError::StaleHeartbeat {
                worker: snapshot.worker_id.clone(),
                sent: snapshot.timestamp,
                stored: record.last_heartbeat,
            };
            drop(workers);
            debug!("Dropping reordered heartbeat: {}", err);
            self.counters.write().await.heartbeats_dropped_stale += 1;
            return Err(err);
        }

        record.last_heartbeat = snapshot.timestamp;
        record.current_load = snapshot.load.clamp(0.0, 1.0);
        record.cpu_percent = snapshot.cpu_percent;
        record.loaded_models = snapshot.loaded_models;
        drop(workers);

        self.counters.write().await.heartbeats_accepted += 1;
        Ok(())
    }

    /// Select the best worker for a service: ACTIVE, offering the service,
    /// lowest effective load. Ties break to the most recent heartbeat, then
    /// to the lexicographically smallest id so selection is deterministic.
    pub async fn select(
        &self,
        service: &str,
        exclude: Option<&WorkerId>,
    ) -> TidepoolResult<WorkerRecord> {
        self.select_at(service, exclude, unix_now()).await
    }

    pub(crate) async fn select_at(
        &self,
        service: &str,
        exclude: Option<&WorkerId>,
        now: u64,
    ) -> TidepoolResult<WorkerRecord> {
        let workers = self.workers.read().await;

        let mut best: Option<(&WorkerRecord, f64)> = None;
        for record in workers.values() {
            if Some(&record.worker_id) == exclude {
                continue;
            }
            if record.status_at(now, self.stale_after_secs, self.expire_after_secs)
                != WorkerStatus::Active
            {
                continue;
            }
            if !record.services.contains(service) {
                continue;
            }

            let in_flight = self
                .in_flight
                .get(&record.worker_id)
                .map(|entry| *entry.value())
                .unwrap_or(0);
            let effective = record.current_load + in_flight as f64 * DISPATCH_LOAD_SHARE;
            if effective > 1.0 {
                continue;
            }

            let better = match best {
                None => true,
                Some((current, current_load)) => {
                    effective < current_load
                        || (effective == current_load
                            && (record.last_heartbeat > current.last_heartbeat
                                || (record.last_heartbeat == current.last_heartbeat
                                    && record.worker_id < current.worker_id)))
                }
            };
            if better {
                best = Some((record, effective));
            }
        }

        best.map(|(record, _)| record.clone())
            .ok_or_else(|| TidepoolError::NoWorkerAvailable(service.to_string()))
    }

    /// Account one in-flight dispatch against a worker. The returned guard
    /// releases the slot on drop, so cancellation (the request future being
    /// dropped) frees the accounting immediately.
    pub fn begin_dispatch(&self, worker_id: &WorkerId) -> DispatchGuard {
        *self.in_flight.entry(worker_id.clone()).or_insert(0) += 1;
        DispatchGuard {
            in_flight: Arc::clone(&self.in_flight),
            worker_id: worker_id.clone(),
        }
    }

    /// Remove records past the expiry window. STALE workers are retained
    /// for diagnostics; only EXPIRED records are purged.
    pub async fn sweep(&self) -> usize {
        self.sweep_at(unix_now()).await
    }

    pub(crate) async fn sweep_at(&self, now: u64) -> usize {
        let mut workers = self.workers.write().await;
        let mut expired: Vec<WorkerId> = Vec::new();
        workers.retain(|worker_id, record| {
            let keep = record.status_at(now, self.stale_after_secs, self.expire_after_secs)
                != WorkerStatus::Expired;
            if !keep {
                expired.push(worker_id.clone());
            }
            keep
        });
        drop(workers);

        for worker_id in &expired {
            self.in_flight.remove(worker_id);
            info!(worker_id = %worker_id, "Purged expired worker");
        }

        if !expired.is_empty() {
            let mut counters = self.counters.write().await;
            counters.workers_expired += expired.len() as u64;
        }

        expired.len()
    }

    /// All records with derived status, for the admin endpoint.
    pub async fn list(&self) -> Vec<WorkerView> {
        self.list_at(unix_now()).await
    }

    pub(crate) async fn list_at(&self, now: u64) -> Vec<WorkerView> {
        let workers = self.workers.read().await;
        let mut views: Vec<WorkerView> = workers
            .values()
            .map(|record| WorkerView {
                status: record.status_at(now, self.stale_after_secs, self.expire_after_secs),
                in_flight: self
                    .in_flight
                    .get(&record.worker_id)
                    .map(|entry| *entry.value())
                    .unwrap_or(0),
                record: record.clone(),
            })
            .collect();
        views.sort_by(|a, b| a.record.worker_id.cmp(&b.record.worker_id));
        views
    }

    /// Registry counters plus current status breakdown.
    pub async fn stats(&self) -> RegistryStats {
        let now = unix_now();
        let workers = self.workers.read().await;
        let mut stats = self.counters.read().await.clone();
        stats.total_workers = workers.len();
        stats.active_workers = workers
            .values()
            .filter(|r| {
                r.status_at(now, self.stale_after_secs, self.expire_after_secs)
                    == WorkerStatus::Active
            })
            .count();
        stats.stale_workers = workers
            .values()
            .filter(|r| {
                r.status_at(now, self.stale_after_secs, self.expire_after_secs)
                    == WorkerStatus::Stale
            })
            .count();
        stats
    }

    /// Mean load across ACTIVE workers, for the edge announcement.
    pub async fn aggregate_load(&self) -> f64 {
        let now = unix_now();
        let workers = self.workers.read().await;
        let active: Vec<f64> = workers
            .values()
            .filter(|r| {
                r.status_at(now, self.stale_after_secs, self.expire_after_secs)
                    == WorkerStatus::Active
            })
            .map(|r| r.current_load)
            .collect();
        if active.is_empty() {
            0.0
        } else {
            active.iter().sum::<f64>() / active.len() as f64
        }
    }

    /// Service types offered by at least one ACTIVE worker.
    pub async fn service_catalog(&self) -> Vec<String> {
        let now = unix_now();
        let workers = self.workers.read().await;
        let mut services: Vec<String> = workers
            .values()
            .filter(|r| {
                r.status_at(now, self.stale_after_secs, self.expire_after_secs)
                    == WorkerStatus::Active
            })
            .flat_map(|r| r.services.iter().cloned())
            .collect();
        services.sort();
        services.dedup();
        services
    }
}

/// RAII accounting for one in-flight dispatch. Dropping the guard (normal
/// completion, error, or client cancellation) releases the slot.
pub struct DispatchGuard {
    in_flight: Arc<DashMap<WorkerId, usize>>,
    worker_id: WorkerId,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        if let Some(mut entry) = self.in_flight.get_mut(&self.worker_id) {
            *entry = entry.saturating_sub(1);
        }
    }
}
