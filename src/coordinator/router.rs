//! # Service Router
//!
//! Routes an inbound service request to the best ACTIVE worker and
//! forwards the payload. A failed worker call is never retried against the
//! same worker; the router reselects once with the failed candidate
//! excluded, then gives up.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::coordinator::registry::WorkerRegistry;
use crate::types::{TidepoolError, TidepoolResult, WorkerId};

pub struct ServiceRouter {
    registry: Arc<WorkerRegistry>,
    http: reqwest::Client,
}

impl ServiceRouter {
    pub fn new(registry: Arc<WorkerRegistry>, worker_call_timeout: Duration) -> TidepoolResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(worker_call_timeout)
            .build()
            .map_err(|e| TidepoolError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { registry, http })
    }

    /// Dispatch a payload to a worker offering `service`. The in-flight
    /// guard lives across the forwarded call, so dropping this future
    /// (client cancellation) releases the worker's slot immediately.
    pub async fn dispatch(
        &self,
        service: &str,
        payload: serde_json::Value,
    ) -> TidepoolResult<serde_json::Value> {
        let first = self.registry.select(service, None).await?;
        debug!(service, worker_id = %first.worker_id, load = first.current_load, "Selected worker");

        match self.forward(&first.worker_id, &first.endpoint, service, &payload).await {
            Ok(response) => Ok(response),
            Err(first_err) => {
                warn!(
                    service,
                    worker_id = %first.worker_id,
                    error = %first_err,
                    "Worker call failed, reselecting"
                );

                // One fallback to a different worker; the failed candidate
                // is excluded rather than retried.
                let second = self
                    .registry
                    .select(service, Some(&first.worker_id))
                    .await
                    .map_err(|_| first_err)?;
                debug!(service, worker_id = %second.worker_id, "Fallback worker selected");
                self.forward(&second.worker_id, &second.endpoint, service, &payload)
                    .await
            }
        }
    }

    async fn forward(
        &self,
        worker_id: &WorkerId,
        endpoint: &str,
        service: &str,
        payload: &serde_json::Value,
    ) -> TidepoolResult<serde_json::Value> {
        let _guard = self.registry.begin_dispatch(worker_id);

        let url = format!("{}/service/{}", endpoint.trim_end_matches('/'), service);
        let response = self
            .http
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| TidepoolError::Upstream(format!("worker {}: {}", worker_id, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TidepoolError::Upstream(format!(
                "worker {} returned {}: {}",
                worker_id, status, body
            )));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| TidepoolError::Upstream(format!("worker {} response: {}", worker_id, e)))
    }
}
