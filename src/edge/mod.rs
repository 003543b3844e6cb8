//! # Edge Router
//!
//! Globally distributed, stateless entry tier. Resolves live coordinators
//! through the strongly-consistent registry store under a strict read/write
//! budget, and forwards registration and service traffic to one of them.

pub mod api;
pub mod cache;
pub mod router;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::EdgeConfig;
use crate::dht::DhtResolver;
use crate::edge::api::{edge_routes, EdgeApiState};

pub use api::BootstrapResponse;
pub use cache::{CacheEntry, EdgeCache};
pub use router::{AnnounceOutcome, BootstrapSeed, EdgeRouter, ProxyReply};
pub use store::{CoordinatorStore, MemoryStore, StoreCounters};

/// Edge service: router + HTTP surface + background sweep.
pub struct EdgeService {
    config: EdgeConfig,
    api_state: Arc<EdgeApiState>,
    running: Arc<RwLock<bool>>,
}

impl EdgeService {
    /// The resolver is built disabled unless the deployment enables the
    /// DHT; the coordinator path stays available either way.
    pub fn new(
        config: EdgeConfig,
        store: Arc<dyn CoordinatorStore>,
        resolver: DhtResolver,
    ) -> Result<Self> {
        let router = EdgeRouter::new(config.clone(), store, resolver)
            .context("Failed to build edge router")?;

        let api_state = Arc::new(EdgeApiState {
            router,
            default_region: config.default_region.clone(),
        });

        Ok(Self {
            config,
            api_state,
            running: Arc::new(RwLock::new(false)),
        })
    }

    pub fn routes(&self) -> axum::Router {
        edge_routes(Arc::clone(&self.api_state))
    }

    /// Start the background sweep that expires cache entries and deletes
    /// long-dead records from the backing store.
    pub async fn start(&self) -> Result<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                anyhow::bail!("Edge service already running");
            }
            *running = true;
        }

        let api_state = Arc::clone(&self.api_state);
        let running = Arc::clone(&self.running);
        let sweep_interval = Duration::from_secs(self.config.store_sweep_interval_secs);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                if !*running.read().await {
                    break;
                }
                match api_state.router.sweep().await {
                    Ok(removed) if removed > 0 => {
                        debug!(removed, "Edge sweep removed dead coordinator records")
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Edge sweep failed"),
                }
            }
        });

        info!(region = %self.config.default_region, "Edge service started");
        Ok(())
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
        info!("Edge service stopped");
    }
}
