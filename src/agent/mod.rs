//! # Worker Agent
//!
//! Runs on donated hardware. Detects capabilities once, registers through
//! the edge (which proxies to a live coordinator), then heartbeats that
//! coordinator directly. Any coordinator error is treated as "assume
//! deregistered": the agent re-runs full registration, which is the
//! system's universal recovery path after coordinator restarts. No
//! operator intervention, ever.

pub mod capabilities;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::agent::capabilities::LoadProbe;
use crate::config::{AgentConfig, DhtSettings};
use crate::dht::{service_key, worker_key, DhtNode, DhtValue, HttpDhtTransport, WorkerAnnouncement};
use crate::types::{unix_now, Tier, TidepoolError, TidepoolResult, WorkerCapabilities};

/// Shape of the register response the agent relies on.
#[derive(Debug, Deserialize)]
struct RegisterReply {
    tier: Tier,
    #[serde(default)]
    assigned_services: Vec<String>,
    coordinator_endpoint: String,
}

/// Shape of the edge bootstrap response.
#[derive(Debug, Deserialize)]
struct BootstrapReply {
    #[serde(default)]
    seeds: Vec<BootstrapSeedReply>,
}

#[derive(Debug, Deserialize)]
struct BootstrapSeedReply {
    endpoint: String,
}

pub struct WorkerAgent {
    config: AgentConfig,
    worker_id: String,
    capabilities: WorkerCapabilities,
    http: reqwest::Client,
    /// Coordinator assigned at registration; heartbeats go here directly.
    coordinator_endpoint: RwLock<Option<String>>,
    probe: Mutex<LoadProbe>,
    dht: Option<Arc<DhtNode>>,
    dht_settings: DhtSettings,
    running: Arc<RwLock<bool>>,
}

impl WorkerAgent {
    pub fn new(config: AgentConfig, dht_settings: DhtSettings) -> Result<Self> {
        let worker_id = if config.worker_id.is_empty() {
            format!("worker-{}", uuid::Uuid::new_v4())
        } else {
            config.worker_id.clone()
        };

        let capabilities = capabilities::detect();
        info!(
            worker_id = %worker_id,
            cpu_cores = capabilities.cpu_cores,
            ram_gb = capabilities.ram_gb,
            gpu_vram_gb = capabilities.gpu_vram_gb,
            "Capabilities detected"
        );

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        let dht = if dht_settings.enabled {
            let transport = Arc::new(
                HttpDhtTransport::new(Duration::from_millis(dht_settings.lookup_timeout_ms))
                    .context("Failed to build DHT transport")?,
            );
            Some(Arc::new(DhtNode::new(
                dht_settings.public_endpoint.clone(),
                dht_settings.clone(),
                transport,
            )))
        } else {
            None
        };

        Ok(Self {
            config,
            worker_id,
            capabilities,
            http,
            coordinator_endpoint: RwLock::new(None),
            probe: Mutex::new(LoadProbe::new()),
            dht,
            dht_settings,
            running: Arc::new(RwLock::new(false)),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn dht_node(&self) -> Option<Arc<DhtNode>> {
        self.dht.clone()
    }

    /// Run the agent: register, then heartbeat until stopped. Returns only
    /// on `stop()` or an unrecoverable caller error (invalid
    /// capabilities).
    pub async fn run(&self) -> Result<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                anyhow::bail!("Agent is already running");
            }
            *running = true;
        }

        self.register_with_backoff().await?;
        self.join_and_publish_dht().await;

        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.heartbeat_interval_secs));
        interval.tick().await; // immediate first tick

        while *self.running.read().await {
            interval.tick().await;
            if !*self.running.read().await {
                break;
            }

            match self.send_heartbeat().await {
                Ok(()) => {
                    debug!(worker_id = %self.worker_id, "Heartbeat sent");
                    self.refresh_dht_announcement().await;
                }
                Err(e) => {
                    // Assume deregistered (coordinator restart, expiry
                    // purge, network partition) and rejoin from scratch.
                    warn!(worker_id = %self.worker_id, error = %e, "Heartbeat failed, re-registering");
                    self.register_with_backoff().await?;
                    self.join_and_publish_dht().await;
                }
            }
        }

        self.unpublish_dht().await;
        info!(worker_id = %self.worker_id, "Agent stopped");
        Ok(())
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
    }

    /// Register through the edge with jittered exponential backoff.
    /// Retries forever on transport/availability errors (an unreachable
    /// edge must never require operator action) but gives up immediately
    /// on `InvalidCapabilities`, which no retry can fix.
    async fn register_with_backoff(&self) -> Result<()> {
        let mut delay = Duration::from_secs(self.config.backoff_initial_secs.max(1));
        let max_delay = Duration::from_secs(self.config.backoff_max_secs);
        let mut attempt = 0u32;

        loop {
            if !*self.running.read().await {
                anyhow::bail!("Agent stopped during registration");
            }
            attempt += 1;

            match self.register_once().await {
                Ok(tier) => {
                    info!(worker_id = %self.worker_id, tier = %tier, attempt, "Registered");
                    return Ok(());
                }
                Err(TidepoolError::InvalidCapabilities(reason)) => {
                    anyhow::bail!("Registration rejected: {}", reason);
                }
                Err(e) => {
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                    warn!(
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "Registration failed, backing off"
                    );
                    tokio::time::sleep(delay + jitter).await;
                    delay = (delay * 2).min(max_delay);
                }
            }
        }
    }

    async fn register_once(&self) -> TidepoolResult<Tier> {
        let url = format!(
            "{}/api/worker/register",
            self.config.edge_url.trim_end_matches('/')
        );
        let payload = serde_json::json!({
            "worker_id": self.worker_id,
            "endpoint": self.config.endpoint,
            "services": self.config.services,
            "capabilities": self.capabilities,
        });

        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| TidepoolError::Upstream(format!("register: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 422 {
            let body = response.text().await.unwrap_or_default();
            return Err(TidepoolError::InvalidCapabilities(body));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TidepoolError::Upstream(format!(
                "register returned {}: {}",
                status, body
            )));
        }

        let reply: RegisterReply = response
            .json()
            .await
            .map_err(|e| TidepoolError::Upstream(format!("register response: {}", e)))?;

        debug!(
            tier = %reply.tier,
            services = ?reply.assigned_services,
            coordinator = %reply.coordinator_endpoint,
            "Registration accepted"
        );
        *self.coordinator_endpoint.write().await = Some(reply.coordinator_endpoint);
        Ok(reply.tier)
    }

    async fn send_heartbeat(&self) -> TidepoolResult<()> {
        let coordinator = self
            .coordinator_endpoint
            .read()
            .await
            .clone()
            .ok_or_else(|| TidepoolError::Upstream("no coordinator assigned".to_string()))?;

        let (load, cpu_percent) = self.probe.lock().await.sample();
        let url = format!("{}/worker/heartbeat", coordinator.trim_end_matches('/'));
        let payload = serde_json::json!({
            "worker_id": self.worker_id,
            "timestamp": unix_now(),
            "load": load,
            "cpu_percent": cpu_percent,
            "loaded_models": [],
        });

        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| TidepoolError::Upstream(format!("heartbeat: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TidepoolError::Upstream(format!(
                "heartbeat returned {}: {}",
                status, body
            )));
        }

        Ok(())
    }

    /// Join the overlay and publish our announcement plus service index
    /// entries. All best-effort: DHT records are advisory.
    async fn join_and_publish_dht(&self) {
        let Some(dht) = &self.dht else { return };

        let mut bootstrap = self.dht_settings.bootstrap_peers.clone();
        bootstrap.extend(self.fetch_bootstrap_seeds().await);
        bootstrap.sort();
        bootstrap.dedup();

        dht.join(&bootstrap).await;
        self.refresh_dht_announcement().await;

        for service in &self.config.services {
            dht.put(
                &service_key(service),
                DhtValue::ServiceIndex {
                    workers: vec![self.worker_id.clone()],
                },
            )
            .await;
        }
    }

    /// Re-publish the worker announcement so `last_seen` stays fresh for
    /// filter-on-read consumers.
    async fn refresh_dht_announcement(&self) {
        let Some(dht) = &self.dht else { return };
        dht.put(
            &worker_key(&self.worker_id),
            DhtValue::Worker(WorkerAnnouncement {
                worker_id: self.worker_id.clone(),
                endpoint: self.config.endpoint.clone(),
                services: self.config.services.clone(),
                capabilities: self.capabilities.clone(),
                last_seen: unix_now(),
            }),
        )
        .await;
    }

    /// Graceful-shutdown unpublish. Best-effort by contract: absence of
    /// this call must not break anything, readers filter stale entries.
    async fn unpublish_dht(&self) {
        let Some(dht) = &self.dht else { return };
        for service in &self.config.services {
            dht.remove_from_service(service, &self.worker_id).await;
        }
    }

    async fn fetch_bootstrap_seeds(&self) -> Vec<String> {
        let url = format!(
            "{}/api/dht/bootstrap",
            self.config.edge_url.trim_end_matches('/')
        );
        match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<BootstrapReply>().await {
                    Ok(reply) => reply.seeds.into_iter().map(|s| s.endpoint).collect(),
                    Err(e) => {
                        warn!(error = %e, "Malformed bootstrap response");
                        vec![]
                    }
                }
            }
            Ok(response) => {
                debug!(status = %response.status(), "Bootstrap seeds unavailable");
                vec![]
            }
            Err(e) => {
                debug!(error = %e, "Bootstrap fetch failed");
                vec![]
            }
        }
    }
}
