//! Fallback completeness: every DHT miss, timeout, or dead-peer dispatch
//! must reach the coordinator path before a caller can observe an error,
//! and a healthy DHT hit must bypass the coordinator entirely.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::Path, routing::post, Json, Router};
use serde_json::json;

use tidepool_node::config::{CoordinatorConfig, DhtSettings, EdgeConfig};
use tidepool_node::coordinator::Coordinator;
use tidepool_node::dht::{
    service_key, worker_key, DhtMessage, DhtNode, DhtPeer, DhtResolver, DhtTransport, DhtValue,
    NodeId, ResolveMiss, WorkerAnnouncement,
};
use tidepool_node::edge::{CoordinatorStore, EdgeRouter, MemoryStore};
use tidepool_node::types::{unix_now, CoordinatorId, CoordinatorRecord, WorkerCapabilities};

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn spawn_stub_worker(name: &'static str) -> String {
    let app = Router::new().route(
        "/service/:service_type",
        post(move |Path(service): Path<String>, Json(payload): Json<serde_json::Value>| async move {
            Json(json!({ "worker": name, "service": service, "echo": payload }))
        }),
    );
    serve(app).await
}

/// A transport whose peers never answer in time.
struct SlowTransport;

#[async_trait]
impl DhtTransport for SlowTransport {
    async fn send(
        &self,
        _endpoint: &str,
        _msg: DhtMessage,
    ) -> tidepool_node::TidepoolResult<Option<DhtMessage>> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(None)
    }
}

/// Coordinator + registered stub worker, with its record seeded into the
/// edge store so the coordinator path is live.
async fn live_coordinator_path(store: &MemoryStore) -> String {
    let worker_url = spawn_stub_worker("coordinator-path-worker").await;
    let coordinator = Arc::new(
        Coordinator::new(CoordinatorConfig::default(), DhtSettings::default()).unwrap(),
    );
    let coord_url = serve(coordinator.routes()).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/worker/register", coord_url))
        .json(&json!({
            "worker_id": "worker-1",
            "endpoint": worker_url,
            "services": ["ocr"],
            "capabilities": { "gpu_vram_gb": 12, "cpu_cores": 8, "ram_gb": 32, "disk_gb": 500 }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    store
        .put(CoordinatorRecord {
            coordinator_id: CoordinatorId::from("coord-1"),
            endpoint: coord_url.clone(),
            region: "default".to_string(),
            last_seen: unix_now(),
        })
        .await
        .unwrap();

    coord_url
}

fn empty_dht_resolver() -> (Arc<DhtNode>, DhtResolver) {
    let node = Arc::new(DhtNode::new(
        "http://127.0.0.1:1".to_string(),
        DhtSettings {
            enabled: true,
            ..Default::default()
        },
        Arc::new(SlowTransport),
    ));
    let resolver = DhtResolver::new(
        Some(Arc::clone(&node)),
        Duration::from_millis(200),
        Duration::from_secs(300),
    );
    (node, resolver)
}

#[tokio::test]
async fn test_dht_miss_falls_back_to_coordinator_path() {
    let store = Arc::new(MemoryStore::new());
    let _coord_url = live_coordinator_path(&store).await;

    let (_node, resolver) = empty_dht_resolver();
    let router = EdgeRouter::new(EdgeConfig::default(), store, resolver).unwrap();

    // Nothing published in the DHT: the request must still succeed via
    // the coordinator.
    let reply = router
        .proxy_service("default", "ocr", json!({ "document": "page-1" }))
        .await
        .unwrap();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body["worker"], "coordinator-path-worker");
}

#[tokio::test]
async fn test_dht_timeout_falls_back_to_coordinator_path() {
    let store = Arc::new(MemoryStore::new());
    let _coord_url = live_coordinator_path(&store).await;

    let (node, resolver) = empty_dht_resolver();
    // A known peer behind a never-answering transport forces the lookup
    // to run into the resolver's timeout.
    node.add_peer(DhtPeer::new(NodeId::random(), "peer-1".to_string()))
        .await;
    assert_eq!(resolver.resolve("ocr").await.unwrap_err(), ResolveMiss::Timeout);

    let router = EdgeRouter::new(EdgeConfig::default(), store, resolver).unwrap();
    let reply = router
        .proxy_service("default", "ocr", json!({}))
        .await
        .unwrap();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body["worker"], "coordinator-path-worker");
}

#[tokio::test]
async fn test_dht_hit_bypasses_coordinators_entirely() {
    // Empty coordinator store: only the DHT knows the worker. Dispatch
    // must still succeed, proving the peer path carries the traffic.
    let worker_url = spawn_stub_worker("dht-worker").await;
    let store = Arc::new(MemoryStore::new());

    let node = Arc::new(DhtNode::new(
        "http://127.0.0.1:1".to_string(),
        DhtSettings {
            enabled: true,
            ..Default::default()
        },
        Arc::new(SlowTransport),
    ));
    node.put(
        &service_key("ocr"),
        DhtValue::ServiceIndex {
            workers: vec!["dht-worker".to_string()],
        },
    )
    .await;
    node.put(
        &worker_key("dht-worker"),
        DhtValue::Worker(WorkerAnnouncement {
            worker_id: "dht-worker".to_string(),
            endpoint: worker_url,
            services: vec!["ocr".to_string()],
            capabilities: WorkerCapabilities::default(),
            last_seen: unix_now(),
        }),
    )
    .await;

    let resolver = DhtResolver::new(
        Some(node),
        Duration::from_millis(500),
        Duration::from_secs(300),
    );
    let router = EdgeRouter::new(EdgeConfig::default(), store.clone(), resolver).unwrap();

    let reply = router
        .proxy_service("default", "ocr", json!({ "document": "page-1" }))
        .await
        .unwrap();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body["worker"], "dht-worker");

    // The coordinator registry was never consulted.
    assert_eq!(store.counters().reads, 0);
}

#[tokio::test]
async fn test_dead_dht_worker_falls_back_to_coordinator_path() {
    let store = Arc::new(MemoryStore::new());
    let _coord_url = live_coordinator_path(&store).await;

    let node = Arc::new(DhtNode::new(
        "http://127.0.0.1:1".to_string(),
        DhtSettings {
            enabled: true,
            ..Default::default()
        },
        Arc::new(SlowTransport),
    ));
    // The announced worker endpoint is dead; dispatch through it fails and
    // the coordinator path must pick it up.
    node.put(
        &service_key("ocr"),
        DhtValue::ServiceIndex {
            workers: vec!["ghost".to_string()],
        },
    )
    .await;
    node.put(
        &worker_key("ghost"),
        DhtValue::Worker(WorkerAnnouncement {
            worker_id: "ghost".to_string(),
            endpoint: "http://127.0.0.1:1".to_string(),
            services: vec!["ocr".to_string()],
            capabilities: WorkerCapabilities::default(),
            last_seen: unix_now(),
        }),
    )
    .await;

    let resolver = DhtResolver::new(
        Some(node),
        Duration::from_millis(500),
        Duration::from_secs(300),
    );
    let router = EdgeRouter::new(EdgeConfig::default(), store, resolver).unwrap();

    let reply = router
        .proxy_service("default", "ocr", json!({}))
        .await
        .unwrap();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body["worker"], "coordinator-path-worker");
}
