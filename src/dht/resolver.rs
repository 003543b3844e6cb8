//! # Service Resolver
//!
//! Consumer-side resolution of `service -> workers` through the DHT, with
//! the mandatory coordinator-path fallback. A DHT miss, a timeout, or a
//! disabled overlay all mean "use the coordinator path"; the overlay is
//! never allowed to make a request fail on its own.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::dht::node::{service_key, worker_key, DhtNode, DhtValue, WorkerAnnouncement};
use crate::types::unix_now;

/// Why the resolver fell through to the coordinator path. Carried so
/// callers can log/count fallbacks distinctly from hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMiss {
    Disabled,
    Timeout,
    NotFound,
}

pub struct DhtResolver {
    node: Option<Arc<DhtNode>>,
    lookup_timeout: Duration,
    staleness: Duration,
}

impl DhtResolver {
    /// `node: None` builds a resolver for a deployment with the DHT
    /// disabled; every resolve reports `Disabled` and the caller goes
    /// straight to the coordinator path.
    pub fn new(node: Option<Arc<DhtNode>>, lookup_timeout: Duration, staleness: Duration) -> Self {
        Self {
            node,
            lookup_timeout,
            staleness,
        }
    }

    pub fn enabled(&self) -> bool {
        self.node.is_some()
    }

    /// Resolve workers currently announcing `service`. Announcements older
    /// than the staleness window are filtered out here (filter-on-read);
    /// stale `service:<type>` index entries are expected and harmless.
    pub async fn resolve(&self, service: &str) -> Result<Vec<WorkerAnnouncement>, ResolveMiss> {
        let Some(node) = &self.node else {
            return Err(ResolveMiss::Disabled);
        };

        let lookup = self.lookup(node, service);
        match tokio::time::timeout(self.lookup_timeout, lookup).await {
            Ok(Some(workers)) if !workers.is_empty() => Ok(workers),
            Ok(_) => Err(ResolveMiss::NotFound),
            Err(_) => {
                debug!(service, "DHT lookup timed out, falling back");
                Err(ResolveMiss::Timeout)
            }
        }
    }

    async fn lookup(&self, node: &Arc<DhtNode>, service: &str) -> Option<Vec<WorkerAnnouncement>> {
        let index = node.get(&service_key(service)).await?;
        let DhtValue::ServiceIndex { workers } = index else {
            return None;
        };

        let cutoff = unix_now().saturating_sub(self.staleness.as_secs());
        let mut fresh = Vec::new();
        for worker_id in workers {
            match node.get(&worker_key(&worker_id)).await {
                Some(DhtValue::Worker(announcement)) if announcement.last_seen >= cutoff => {
                    fresh.push(announcement);
                }
                Some(DhtValue::Worker(_)) => {
                    debug!(worker_id, "Skipping stale announcement");
                }
                _ => {}
            }
        }
        Some(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::node::tests::make_mesh;
    use crate::types::WorkerCapabilities;

    fn announcement(worker_id: &str, last_seen: u64) -> WorkerAnnouncement {
        WorkerAnnouncement {
            worker_id: worker_id.to_string(),
            endpoint: format!("http://{}.local:9000", worker_id),
            services: vec!["ocr".to_string()],
            capabilities: WorkerCapabilities::default(),
            last_seen,
        }
    }

    #[tokio::test]
    async fn test_disabled_resolver_reports_disabled() {
        let resolver = DhtResolver::new(None, Duration::from_millis(800), Duration::from_secs(300));
        assert_eq!(
            resolver.resolve("ocr").await.unwrap_err(),
            ResolveMiss::Disabled
        );
    }

    #[tokio::test]
    async fn test_resolve_filters_stale_announcements() {
        let (_transport, nodes) = make_mesh(2).await;
        let now = unix_now();

        nodes[0]
            .put(
                &service_key("ocr"),
                DhtValue::ServiceIndex {
                    workers: vec!["fresh".to_string(), "stale".to_string()],
                },
            )
            .await;
        nodes[0]
            .put(
                &worker_key("fresh"),
                DhtValue::Worker(announcement("fresh", now)),
            )
            .await;
        nodes[0]
            .put(
                &worker_key("stale"),
                DhtValue::Worker(announcement("stale", now.saturating_sub(10_000))),
            )
            .await;

        let resolver = DhtResolver::new(
            Some(nodes[1].clone()),
            Duration::from_millis(800),
            Duration::from_secs(300),
        );
        let workers = resolver.resolve("ocr").await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].worker_id, "fresh");
    }

    #[tokio::test]
    async fn test_resolve_miss_reports_not_found() {
        let (_transport, nodes) = make_mesh(2).await;
        let resolver = DhtResolver::new(
            Some(nodes[0].clone()),
            Duration::from_millis(800),
            Duration::from_secs(300),
        );
        assert_eq!(
            resolver.resolve("nothing").await.unwrap_err(),
            ResolveMiss::NotFound
        );
    }

    #[tokio::test]
    async fn test_resolve_all_stale_reports_not_found() {
        let (_transport, nodes) = make_mesh(1).await;
        nodes[0]
            .put(
                &service_key("ocr"),
                DhtValue::ServiceIndex {
                    workers: vec!["stale".to_string()],
                },
            )
            .await;
        nodes[0]
            .put(&worker_key("stale"), DhtValue::Worker(announcement("stale", 1)))
            .await;

        let resolver = DhtResolver::new(
            Some(nodes[0].clone()),
            Duration::from_millis(800),
            Duration::from_secs(300),
        );
        assert_eq!(
            resolver.resolve("ocr").await.unwrap_err(),
            ResolveMiss::NotFound
        );
    }
}
