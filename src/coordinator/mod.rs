//! # Coordinator
//!
//! Per-region process owning the ephemeral worker registry: registration,
//! heartbeats, health sweep, request routing, and self-announcement to the
//! edge layer. The registry is wiped on restart by design; workers recover
//! by re-registering on their next failed heartbeat.

pub mod api;
pub mod registry;
pub mod router;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{extract::State, routing::post, Json, Router};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{CoordinatorConfig, DhtSettings};
use crate::dht::{DhtMessage, DhtNode, HttpDhtTransport};
use crate::types::{unix_now, CoordinatorAnnounce, CoordinatorId, CoordinatorStatus};

pub use api::{coordinator_routes, CoordinatorApiState};
pub use registry::{
    HeartbeatSnapshot, Registration, RegistryStats, TierAssignment, WorkerRecord, WorkerRegistry,
    WorkerStatus, WorkerView,
};
pub use router::ServiceRouter;

/// Coordinator service: registry + router + background tasks.
pub struct Coordinator {
    config: CoordinatorConfig,
    coordinator_id: CoordinatorId,
    registry: Arc<WorkerRegistry>,
    api_state: Arc<CoordinatorApiState>,
    dht: Option<Arc<DhtNode>>,
    dht_settings: DhtSettings,
    running: Arc<RwLock<bool>>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, dht_settings: DhtSettings) -> Result<Self> {
        let coordinator_id = if config.coordinator_id.is_empty() {
            CoordinatorId::new(format!("coord-{}", uuid::Uuid::new_v4()))
        } else {
            CoordinatorId::new(config.coordinator_id.clone())
        };

        let registry = Arc::new(WorkerRegistry::new(
            config.stale_after_secs,
            config.expire_after_secs(),
        ));

        let router = ServiceRouter::new(
            Arc::clone(&registry),
            Duration::from_secs(config.worker_call_timeout_secs),
        )
        .context("Failed to build service router")?;

        let api_state = Arc::new(CoordinatorApiState {
            registry: Arc::clone(&registry),
            router,
            public_endpoint: config.public_endpoint.clone(),
            recommended_heartbeat_secs: (config.stale_after_secs / 3).max(1),
        });

        // Coordinators are the overlay's stable bootstrap nodes.
        let dht = if dht_settings.enabled {
            let transport = Arc::new(
                HttpDhtTransport::new(Duration::from_millis(dht_settings.lookup_timeout_ms))
                    .context("Failed to build DHT transport")?,
            );
            Some(Arc::new(DhtNode::new(
                config.public_endpoint.clone(),
                dht_settings.clone(),
                transport,
            )))
        } else {
            None
        };

        Ok(Self {
            config,
            coordinator_id,
            registry,
            api_state,
            dht,
            dht_settings,
            running: Arc::new(RwLock::new(false)),
        })
    }

    pub fn coordinator_id(&self) -> &CoordinatorId {
        &self.coordinator_id
    }

    pub fn registry(&self) -> Arc<WorkerRegistry> {
        Arc::clone(&self.registry)
    }

    /// Full route table for this coordinator's HTTP server.
    pub fn routes(&self) -> Router {
        let mut router = coordinator_routes(Arc::clone(&self.api_state));
        if let Some(dht) = &self.dht {
            router = router.merge(dht_routes(Arc::clone(dht)));
        }
        router
    }

    /// Start background tasks: registry sweep, edge announcement, DHT join.
    pub async fn start(&self) -> Result<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                anyhow::bail!("Coordinator already running");
            }
            *running = true;
        }

        self.spawn_sweep_task();

        if self.config.edge_url.is_empty() {
            warn!("No edge_url configured, running standalone (no announcements)");
        } else {
            self.spawn_announce_task()?;
        }

        if let Some(dht) = &self.dht {
            let bootstrap = self.dht_settings.bootstrap_peers.clone();
            let dht = Arc::clone(dht);
            tokio::spawn(async move {
                dht.join(&bootstrap).await;
            });
        }

        info!(coordinator_id = %self.coordinator_id, region = %self.config.region, "Coordinator started");
        Ok(())
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
        info!(coordinator_id = %self.coordinator_id, "Coordinator stopped");
    }

    fn spawn_sweep_task(&self) {
        let registry = Arc::clone(&self.registry);
        let dht = self.dht.clone();
        let running = Arc::clone(&self.running);
        let sweep_interval = Duration::from_secs(self.config.sweep_interval_secs);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                if !*running.read().await {
                    break;
                }
                let purged = registry.sweep().await;
                if purged > 0 {
                    debug!(purged, "Registry sweep removed expired workers");
                }
                if let Some(dht) = &dht {
                    let pruned = dht.prune().await;
                    if pruned > 0 {
                        debug!(pruned, "DHT prune removed stale announcements");
                    }
                }
            }
        });
    }

    fn spawn_announce_task(&self) -> Result<()> {
        let registry = Arc::clone(&self.registry);
        let running = Arc::clone(&self.running);
        let coordinator_id = self.coordinator_id.clone();
        let endpoint = self.config.public_endpoint.clone();
        let region = self.config.region.clone();
        let announce_url = format!(
            "{}/api/coordinator/announce",
            self.config.edge_url.trim_end_matches('/')
        );
        let announce_interval = Duration::from_secs(self.config.announce_interval_secs);

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build announce HTTP client")?;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(announce_interval);
            loop {
                interval.tick().await;
                if !*running.read().await {
                    break;
                }

                let announce = CoordinatorAnnounce {
                    coordinator_id: coordinator_id.clone(),
                    endpoint: endpoint.clone(),
                    region: region.clone(),
                    status: CoordinatorStatus::Active,
                    load: registry.aggregate_load().await,
                    services: registry.service_catalog().await,
                };

                // Announce failures are routine while the edge is down;
                // the edge's staleness window handles prolonged absence.
                match http.post(&announce_url).json(&announce).send().await {
                    Ok(response) if response.status().is_success() => {
                        debug!(ts = unix_now(), "Announced to edge");
                    }
                    Ok(response) => {
                        warn!(status = %response.status(), "Edge rejected announcement");
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to announce to edge");
                    }
                }
            }
        });

        Ok(())
    }
}

/// Route table for the DHT message endpoint mounted alongside the API when
/// the overlay is enabled.
pub fn dht_routes(node: Arc<DhtNode>) -> Router {
    Router::new()
        .route("/dht/message", post(dht_message))
        .with_state(node)
}

async fn dht_message(
    State(node): State<Arc<DhtNode>>,
    Json(msg): Json<DhtMessage>,
) -> Json<Option<DhtMessage>> {
    Json(node.handle_message(msg).await)
}
