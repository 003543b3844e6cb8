//! End-to-end edge flow over real HTTP: coordinator announcement, proxied
//! registration and dispatch, bootstrap seeds, and hard-failure behavior
//! with an empty coordinator registry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::Path, routing::post, Json, Router};
use serde_json::json;

use tidepool_node::config::{CoordinatorConfig, DhtSettings, EdgeConfig};
use tidepool_node::coordinator::Coordinator;
use tidepool_node::dht::DhtResolver;
use tidepool_node::edge::{EdgeService, MemoryStore};

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

/// Coordinator whose announced endpoint matches its real server address.
async fn spawn_coordinator() -> String {
    let coordinator = Arc::new(
        Coordinator::new(CoordinatorConfig::default(), DhtSettings::default()).unwrap(),
    );
    serve(coordinator.routes()).await
}

fn disabled_resolver() -> DhtResolver {
    DhtResolver::new(None, Duration::from_millis(800), Duration::from_secs(300))
}

async fn spawn_edge(store: Arc<MemoryStore>) -> String {
    let edge = EdgeService::new(EdgeConfig::default(), store, disabled_resolver()).unwrap();
    serve(edge.routes()).await
}

async fn announce(client: &reqwest::Client, edge_url: &str, id: &str, endpoint: &str) {
    let response = client
        .post(format!("{}/api/coordinator/announce", edge_url))
        .json(&json!({
            "coordinator_id": id,
            "endpoint": endpoint,
            "region": "default",
            "status": "active",
            "load": 0.1,
            "services": ["ocr"]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_register_and_dispatch_through_edge() {
    let worker_url = spawn_stub_worker("worker-1").await;
    let coord_url = spawn_coordinator().await;
    let store = Arc::new(MemoryStore::new());
    let edge_url = spawn_edge(store).await;
    let client = reqwest::Client::new();

    announce(&client, &edge_url, "coord-1", &coord_url).await;

    // Registration proxies to the coordinator; its 200 + tier pass back.
    let response = client
        .post(format!("{}/api/worker/register", edge_url))
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
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["tier"], "gpu");

    // Service dispatch rides edge -> coordinator -> worker and back.
    let response = client
        .post(format!("{}/api/service/ocr", edge_url))
        .json(&json!({ "document": "page-1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["worker"], "worker-1");
    assert_eq!(body["echo"]["document"], "page-1");
}

#[tokio::test]
async fn test_coordinator_errors_relay_through_edge() {
    let coord_url = spawn_coordinator().await;
    let store = Arc::new(MemoryStore::new());
    let edge_url = spawn_edge(store).await;
    let client = reqwest::Client::new();

    announce(&client, &edge_url, "coord-1", &coord_url).await;

    // Invalid capabilities: the coordinator's 422 must reach the caller.
    let response = client
        .post(format!("{}/api/worker/register", edge_url))
        .json(&json!({
            "worker_id": "worker-1",
            "endpoint": "http://worker.local:9000",
            "services": ["ocr"],
            "capabilities": {}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 422);

    // No worker for the service: the coordinator's 503 relays too.
    let response = client
        .post(format!("{}/api/service/ocr", edge_url))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
}

#[tokio::test]
async fn test_empty_registry_returns_503_not_a_hang() {
    let store = Arc::new(MemoryStore::new());
    let edge_url = spawn_edge(store).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/api/service/ocr", edge_url))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "service_unavailable");
}

#[tokio::test]
async fn test_announce_write_suppression_over_http() {
    let store = Arc::new(MemoryStore::new());
    let edge_url = spawn_edge(store.clone()).await;
    let client = reqwest::Client::new();

    // First announce persists, repeats with identical state are
    // suppressed.
    for i in 0..20 {
        let response = client
            .post(format!("{}/api/coordinator/announce", edge_url))
            .json(&json!({
                "coordinator_id": "coord-1",
                "endpoint": "http://coord-1.local:8080",
                "region": "default",
                "status": "active",
                "load": 0.1,
                "services": ["ocr"]
            }))
            .send()
            .await
            .unwrap();
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["persisted"], i == 0, "announce {} persistence", i);
    }
    assert_eq!(store.counters().writes, 1);
}

#[tokio::test]
async fn test_bootstrap_seeds_endpoint() {
    let coord_url = spawn_coordinator().await;
    let store = Arc::new(MemoryStore::new());
    let edge_url = spawn_edge(store).await;
    let client = reqwest::Client::new();

    announce(&client, &edge_url, "coord-1", &coord_url).await;

    let body: serde_json::Value = client
        .get(format!("{}/api/dht/bootstrap", edge_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let seeds = body["seeds"].as_array().unwrap();
    assert_eq!(seeds.len(), 1);
    assert_eq!(seeds[0]["endpoint"], coord_url);
    assert!(body["ttl"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_proxy_retries_a_different_coordinator() {
    // One dead coordinator, one live; dispatch must fail over rather than
    // retry the dead target.
    let worker_url = spawn_stub_worker("worker-1").await;
    let coord_url = spawn_coordinator().await;
    let store = Arc::new(MemoryStore::new());
    let edge_url = spawn_edge(store).await;
    let client = reqwest::Client::new();

    announce(&client, &edge_url, "coord-dead", "http://127.0.0.1:1").await;
    announce(&client, &edge_url, "coord-live", &coord_url).await;

    // Register through the edge until the live coordinator holds the
    // worker (round-robin may hit the dead one first; the proxy's
    // different-candidate retry covers it).
    let response = client
        .post(format!("{}/api/worker/register", edge_url))
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

    let response = client
        .post(format!("{}/api/service/ocr", edge_url))
        .json(&json!({ "document": "page-1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["worker"], "worker-1");
}
