//! # Edge Router
//!
//! Stateless fan-out from public traffic to a live coordinator. Holds no
//! worker state; the only durable data it touches is the coordinator
//! registry store, and every touch is budgeted: TTL-cached reads, write
//! suppression on announcements, coarse invalidation on persisted writes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::EdgeConfig;
use crate::dht::{DhtResolver, NodeId, ResolveMiss};
use crate::edge::cache::EdgeCache;
use crate::edge::store::CoordinatorStore;
use crate::types::{
    unix_now, CoordinatorAnnounce, CoordinatorId, CoordinatorRecord, CoordinatorStatus,
    TidepoolError, TidepoolResult,
};

/// Last state durably written for a coordinator; the basis for write
/// suppression decisions. Process-local: a restarted edge instance simply
/// persists the next announcement it sees.
#[derive(Debug, Clone)]
struct PersistedMeta {
    status: CoordinatorStatus,
    load: f64,
    services: Vec<String>,
    written_at: u64,
}

/// Outcome of an announcement, reported back to the coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct AnnounceOutcome {
    pub persisted: bool,
}

/// Relayed response from a proxied call: pass the downstream status and
/// body through untouched so coordinator errors (422, 503) reach the
/// caller with their original meaning.
#[derive(Debug)]
pub struct ProxyReply {
    pub status: u16,
    pub body: serde_json::Value,
}

/// A DHT bootstrap seed handed to joining workers.
#[derive(Debug, Clone, Serialize)]
pub struct BootstrapSeed {
    pub node_id: NodeId,
    pub endpoint: String,
}

pub struct EdgeRouter {
    config: EdgeConfig,
    store: Arc<dyn CoordinatorStore>,
    cache: EdgeCache,
    resolver: DhtResolver,
    http: reqwest::Client,
    round_robin: AtomicUsize,
    persisted: DashMap<CoordinatorId, PersistedMeta>,
}

impl EdgeRouter {
    pub fn new(
        config: EdgeConfig,
        store: Arc<dyn CoordinatorStore>,
        resolver: DhtResolver,
    ) -> TidepoolResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(config.proxy_timeout_secs))
            .build()
            .map_err(|e| TidepoolError::Config(format!("failed to build HTTP client: {}", e)))?;

        let cache = EdgeCache::new(Duration::from_secs(config.cache_ttl_secs));

        Ok(Self {
            config,
            store,
            cache,
            resolver,
            http,
            round_robin: AtomicUsize::new(0),
            persisted: DashMap::new(),
        })
    }

    pub fn cache(&self) -> &EdgeCache {
        &self.cache
    }

    /// Handle a coordinator announcement with write suppression.
    pub async fn announce(&self, announce: CoordinatorAnnounce) -> TidepoolResult<AnnounceOutcome> {
        self.announce_at(announce, unix_now()).await
    }

    pub(crate) async fn announce_at(
        &self,
        announce: CoordinatorAnnounce,
        now: u64,
    ) -> TidepoolResult<AnnounceOutcome> {
        let mut services = announce.services.clone();
        services.sort();
        services.dedup();

        let should_persist = match self.persisted.get(&announce.coordinator_id) {
            None => true,
            Some(meta) => {
                meta.status != announce.status
                    || (meta.load - announce.load).abs() > self.config.write_load_delta
                    || meta.services != services
                    || now.saturating_sub(meta.written_at) > self.config.max_write_interval_secs
            }
        };

        let record = CoordinatorRecord {
            coordinator_id: announce.coordinator_id.clone(),
            endpoint: announce.endpoint.clone(),
            region: announce.region.clone(),
            last_seen: now,
        };

        if should_persist {
            self.put_with_retry(record.clone()).await?;
            self.persisted.insert(
                announce.coordinator_id.clone(),
                PersistedMeta {
                    status: announce.status,
                    load: announce.load,
                    services,
                    written_at: now,
                },
            );
            self.cache.put_record(record);
            self.cache.invalidate_regions();
            debug!(coordinator_id = %announce.coordinator_id, "Announcement persisted");
        } else {
            // Suppressed write: the durable store is untouched but the
            // local cache must still see the fresh record.
            self.cache.put_record(record.clone());
            self.cache.patch_region(&record);
            debug!(coordinator_id = %announce.coordinator_id, "Announcement suppressed");
        }

        Ok(AnnounceOutcome {
            persisted: should_persist,
        })
    }

    /// One registry write with a single backoff retry. Registry calls may
    /// be retried (unlike worker calls) because upserts are idempotent.
    async fn put_with_retry(&self, record: CoordinatorRecord) -> TidepoolResult<()> {
        let timeout = Duration::from_secs(self.config.store_timeout_secs);
        match tokio::time::timeout(timeout, self.store.put(record.clone())).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => warn!(error = %e, "Store put failed, retrying once"),
            Err(_) => warn!("Store put timed out, retrying once"),
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        tokio::time::timeout(timeout, self.store.put(record))
            .await
            .map_err(|_| TidepoolError::Upstream("registry store put timed out".to_string()))?
    }

    /// Healthy coordinators for a region: cache hit costs zero store
    /// reads; a miss costs exactly one.
    pub async fn healthy_coordinators(
        &self,
        region: &str,
    ) -> TidepoolResult<Vec<CoordinatorRecord>> {
        if let Some(cached) = self.cache.region(region) {
            return Ok(cached);
        }
        self.refresh_region(region).await
    }

    async fn refresh_region(&self, region: &str) -> TidepoolResult<Vec<CoordinatorRecord>> {
        let min_last_seen = unix_now().saturating_sub(self.config.staleness_window_secs);
        let timeout = Duration::from_secs(self.config.store_timeout_secs);
        let records = tokio::time::timeout(timeout, self.store.list(region, min_last_seen))
            .await
            .map_err(|_| TidepoolError::Upstream("registry store list timed out".to_string()))??;
        self.cache.put_region(region, records.clone());
        Ok(records)
    }

    /// Round-robin pick among healthy coordinators. An empty list triggers
    /// one forced refresh before giving up with `ServiceUnavailable`: no
    /// blocking, no silent retries that could cascade load.
    pub async fn pick_coordinator(
        &self,
        region: &str,
        exclude: Option<&CoordinatorId>,
    ) -> TidepoolResult<CoordinatorRecord> {
        let mut candidates = self.healthy_coordinators(region).await?;
        if let Some(exclude) = exclude {
            candidates.retain(|r| &r.coordinator_id != exclude);
        }

        if candidates.is_empty() {
            candidates = self.refresh_region(region).await?;
            if let Some(exclude) = exclude {
                candidates.retain(|r| &r.coordinator_id != exclude);
            }
        }

        if candidates.is_empty() {
            return Err(TidepoolError::ServiceUnavailable(region.to_string()));
        }

        let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Ok(candidates[index].clone())
    }

    /// Proxy a worker registration to a live coordinator. Registration is
    /// idempotent, so a transport failure may retry one different
    /// coordinator.
    pub async fn proxy_register(
        &self,
        region: &str,
        payload: serde_json::Value,
    ) -> TidepoolResult<ProxyReply> {
        let first = self.pick_coordinator(region, None).await?;
        let url = format!(
            "{}/worker/register",
            first.endpoint.trim_end_matches('/')
        );
        match self.relay(&url, &payload).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                warn!(coordinator_id = %first.coordinator_id, error = %e, "Register proxy failed, trying another coordinator");
                let second = self
                    .pick_coordinator(region, Some(&first.coordinator_id))
                    .await
                    .map_err(|_| e)?;
                let url = format!(
                    "{}/worker/register",
                    second.endpoint.trim_end_matches('/')
                );
                self.relay(&url, &payload).await
            }
        }
    }

    /// Proxy a service request. When the DHT is enabled, resolution is
    /// attempted there first and the payload goes straight to the worker;
    /// any miss, timeout, or dispatch failure falls back to the
    /// coordinator path before the caller can observe an error.
    pub async fn proxy_service(
        &self,
        region: &str,
        service: &str,
        payload: serde_json::Value,
    ) -> TidepoolResult<ProxyReply> {
        if self.resolver.enabled() {
            match self.resolver.resolve(service).await {
                Ok(workers) => {
                    let pick = rand::thread_rng().gen_range(0..workers.len());
                    let worker = &workers[pick];
                    let url = format!(
                        "{}/service/{}",
                        worker.endpoint.trim_end_matches('/'),
                        service
                    );
                    match self.relay(&url, &payload).await {
                        Ok(reply) => {
                            debug!(service, worker_id = %worker.worker_id, "Dispatched via DHT");
                            return Ok(reply);
                        }
                        Err(e) => {
                            warn!(service, worker_id = %worker.worker_id, error = %e, "DHT-resolved dispatch failed, falling back to coordinator path");
                        }
                    }
                }
                Err(ResolveMiss::Disabled) => {}
                Err(miss) => {
                    debug!(service, ?miss, "DHT resolve fell through");
                }
            }
        }

        let first = self.pick_coordinator(region, None).await?;
        let url = format!(
            "{}/service/{}",
            first.endpoint.trim_end_matches('/'),
            service
        );
        match self.relay(&url, &payload).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                warn!(coordinator_id = %first.coordinator_id, error = %e, "Service proxy failed, trying another coordinator");
                let second = self
                    .pick_coordinator(region, Some(&first.coordinator_id))
                    .await
                    .map_err(|_| e)?;
                let url = format!(
                    "{}/service/{}",
                    second.endpoint.trim_end_matches('/'),
                    service
                );
                self.relay(&url, &payload).await
            }
        }
    }

    /// Forward a JSON POST and relay status + body. Non-2xx downstream
    /// responses are a successful relay, not a transport error.
    async fn relay(&self, url: &str, payload: &serde_json::Value) -> TidepoolResult<ProxyReply> {
        let response = self
            .http
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| TidepoolError::Upstream(format!("{}: {}", url, e)))?;

        let status = response.status().as_u16();
        let body = response
            .json::<serde_json::Value>()
            .await
            .unwrap_or_else(|_| serde_json::json!({}));
        Ok(ProxyReply { status, body })
    }

    /// Bootstrap seeds for DHT joiners: the currently-known healthy
    /// coordinators. The node ids are derived, advisory hints; joiners
    /// learn real ids from the first Pong.
    pub async fn bootstrap_seeds(
        &self,
        region: &str,
    ) -> TidepoolResult<(Vec<BootstrapSeed>, u64)> {
        let coordinators = self.healthy_coordinators(region).await?;
        let seeds = coordinators
            .into_iter()
            .map(|record| BootstrapSeed {
                node_id: NodeId::from_key(record.coordinator_id.as_str()),
                endpoint: record.endpoint,
            })
            .collect();
        Ok((seeds, self.config.cache_ttl_secs))
    }

    /// Background maintenance: expire cache entries and delete store
    /// records unseen for several staleness windows.
    pub async fn sweep(&self) -> TidepoolResult<usize> {
        self.cache.cleanup_expired();
        let cutoff = unix_now()
            .saturating_sub(self.config.staleness_window_secs * self.config.sweep_after_windows);
        self.store.sweep(cutoff).await
    }
}
