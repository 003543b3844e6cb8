//! # DHT Node
//!
//! Kademlia-style peer for decentralized service discovery. Coordinators
//! join as stable bootstrap nodes; worker agents join to publish their
//! announcements so consumers can resolve `service -> worker` without a
//! coordinator round trip.
//!
//! Records are advisory. Consumers must tolerate stale or missing entries
//! and fall back to the coordinator path (see `resolver`).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::DhtSettings;
use crate::types::{unix_now, TidepoolError, TidepoolResult, WorkerCapabilities};

/// Size of node IDs in bytes (256-bit).
const ID_SIZE: usize = 32;
const ID_BITS: usize = ID_SIZE * 8;

/// Kademlia k-bucket size.
const K_BUCKET_SIZE: usize = 20;

/// Parallel lookup width.
const ALPHA: usize = 3;

/// 256-bit DHT node/key identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NodeId([u8; ID_SIZE]);

impl NodeId {
    pub fn random() -> Self {
        use rand::RngCore;
        let mut id = [0u8; ID_SIZE];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut id = [0u8; ID_SIZE];
        let len = bytes.len().min(ID_SIZE);
        id[..len].copy_from_slice(&bytes[..len]);
        Self(id)
    }

    /// Hash an arbitrary key (e.g. `worker:<id>`, `service:<type>`) into
    /// the ID space.
    pub fn from_key(key: &str) -> Self {
        let mut hasher = Sha3_256::new();
        hasher.update(key.as_bytes());
        Self::from_bytes(&hasher.finalize())
    }

    /// XOR distance metric.
    pub fn distance(&self, other: &NodeId) -> NodeId {
        let mut out = [0u8; ID_SIZE];
        for i in 0..ID_SIZE {
            out[i] = self.0[i] ^ other.0[i];
        }
        NodeId(out)
    }

    /// Index of the k-bucket the other node falls into, `None` for self.
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        let distance = self.distance(other);
        for (byte_index, byte) in distance.0.iter().enumerate() {
            if *byte != 0 {
                let bit_index = 7 - byte.leading_zeros() as usize;
                return Some(ID_BITS - 1 - (byte_index * 8 + (7 - bit_index)));
            }
        }
        None
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({}...)", hex::encode(&self.0[..4]))
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for NodeId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        hex::encode(self.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        Ok(Self::from_bytes(&bytes))
    }
}

/// Key for a worker announcement record.
pub fn worker_key(worker_id: &str) -> String {
    format!("worker:{}", worker_id)
}

/// Key for a service index record.
pub fn service_key(service: &str) -> String {
    format!("service:{}", service)
}

/// A worker's self-published announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerAnnouncement {
    pub worker_id: String,
    pub endpoint: String,
    pub services: Vec<String>,
    #[serde(default)]
    pub capabilities: WorkerCapabilities,
    /// Unix seconds; readers drop announcements older than the configured
    /// staleness window.
    pub last_seen: u64,
}

/// Value stored under a DHT key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DhtValue {
    Worker(WorkerAnnouncement),
    /// Worker ids offering a service. Entries may be stale; readers filter
    /// through the corresponding worker announcements.
    ServiceIndex { workers: Vec<String> },
}

#[derive(Debug, Clone)]
struct StoredRecord {
    value: DhtValue,
    updated_at: u64,
}

/// A known peer in the overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtPeer {
    pub node_id: NodeId,
    pub endpoint: String,
    pub last_seen: u64,
}

impl DhtPeer {
    pub fn new(node_id: NodeId, endpoint: String) -> Self {
        Self {
            node_id,
            endpoint,
            last_seen: unix_now(),
        }
    }
}

/// K-bucket holding peers at one distance range, oldest first, with a
/// replacement cache for when the bucket is full.
#[derive(Debug, Default, Clone)]
struct KBucket {
    peers: VecDeque<DhtPeer>,
    replacements: VecDeque<DhtPeer>,
}

impl KBucket {
    fn upsert(&mut self, peer: DhtPeer) -> bool {
        if let Some(pos) = self.peers.iter().position(|p| p.node_id == peer.node_id) {
            self.peers.remove(pos);
            self.peers.push_back(peer);
            return true;
        }
        if self.peers.len() < K_BUCKET_SIZE {
            self.peers.push_back(peer);
            return true;
        }
        if self.replacements.len() >= K_BUCKET_SIZE {
            self.replacements.pop_front();
        }
        self.replacements.push_back(peer);
        false
    }

    fn remove(&mut self, node_id: &NodeId) {
        if let Some(pos) = self.peers.iter().position(|p| &p.node_id == node_id) {
            self.peers.remove(pos);
            if let Some(replacement) = self.replacements.pop_front() {
                self.peers.push_back(replacement);
            }
        }
    }

    fn peers(&self) -> impl Iterator<Item = &DhtPeer> {
        self.peers.iter()
    }
}

/// Wire messages between DHT peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DhtMessage {
    Ping {
        sender: DhtPeer,
        nonce: u64,
    },
    Pong {
        sender: DhtPeer,
        nonce: u64,
    },
    FindNode {
        sender: DhtPeer,
        target: NodeId,
    },
    FoundNodes {
        sender: DhtPeer,
        nodes: Vec<DhtPeer>,
    },
    Store {
        sender: DhtPeer,
        key: String,
        value: DhtValue,
    },
    StoreAck {
        sender: DhtPeer,
        key: String,
        accepted: bool,
    },
    FindValue {
        sender: DhtPeer,
        key: String,
    },
    FoundValue {
        sender: DhtPeer,
        key: String,
        value: Option<DhtValue>,
        closer: Vec<DhtPeer>,
    },
}

/// Message delivery between peers. The production implementation posts to
/// the peer's `/dht/message` endpoint; tests wire nodes together in
/// process.
#[async_trait]
pub trait DhtTransport: Send + Sync {
    async fn send(&self, endpoint: &str, msg: DhtMessage) -> TidepoolResult<Option<DhtMessage>>;
}

/// HTTP transport with a bounded sub-second timeout per call.
pub struct HttpDhtTransport {
    http: reqwest::Client,
}

impl HttpDhtTransport {
    pub fn new(timeout: std::time::Duration) -> TidepoolResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| TidepoolError::Config(format!("failed to build DHT client: {}", e)))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl DhtTransport for HttpDhtTransport {
    async fn send(&self, endpoint: &str, msg: DhtMessage) -> TidepoolResult<Option<DhtMessage>> {
        let url = format!("{}/dht/message", endpoint.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(&msg)
            .send()
            .await
            .map_err(|e| TidepoolError::Upstream(format!("dht peer {}: {}", endpoint, e)))?;
        if !response.status().is_success() {
            return Err(TidepoolError::Upstream(format!(
                "dht peer {} returned {}",
                endpoint,
                response.status()
            )));
        }
        response
            .json::<Option<DhtMessage>>()
            .await
            .map_err(|e| TidepoolError::Upstream(format!("dht peer {} reply: {}", endpoint, e)))
    }
}

/// Overlay statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DhtStats {
    pub known_peers: usize,
    pub local_records: usize,
    pub lookups: u64,
    pub lookup_hits: u64,
    pub messages_received: u64,
    pub stores_accepted: u64,
}

/// A DHT node: routing table plus local record store.
pub struct DhtNode {
    node_id: NodeId,
    endpoint: String,
    settings: DhtSettings,
    routing: RwLock<Vec<KBucket>>,
    store: RwLock<HashMap<String, StoredRecord>>,
    transport: Arc<dyn DhtTransport>,
    stats: RwLock<DhtStats>,
}

impl DhtNode {
    /// `endpoint` is this node's own advertised address, sent with every
    /// message so peers can learn it.
    pub fn new(endpoint: String, settings: DhtSettings, transport: Arc<dyn DhtTransport>) -> Self {
        Self {
            node_id: NodeId::random(),
            endpoint,
            settings,
            routing: RwLock::new(vec![KBucket::default(); ID_BITS]),
            store: RwLock::new(HashMap::new()),
            transport,
            stats: RwLock::new(DhtStats::default()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn self_peer(&self) -> DhtPeer {
        DhtPeer::new(self.node_id, self.endpoint.clone())
    }

    /// Join the overlay: ping each bootstrap peer, then look up our own id
    /// to populate nearby buckets. Unreachable seeds are skipped; joining
    /// with zero live seeds leaves this node as an initial member.
    pub async fn join(&self, bootstrap: &[String]) -> usize {
        let mut reached = 0;
        for endpoint in bootstrap {
            if endpoint == &self.endpoint {
                continue;
            }
            let msg = DhtMessage::Ping {
                sender: self.self_peer(),
                nonce: rand::random(),
            };
            match self.transport.send(endpoint, msg).await {
                Ok(Some(DhtMessage::Pong { sender, .. })) => {
                    self.add_peer(sender).await;
                    reached += 1;
                }
                Ok(_) => {}
                Err(e) => debug!("Bootstrap peer {} unreachable: {}", endpoint, e),
            }
        }

        if reached > 0 {
            // Self-lookup fills the buckets closest to us.
            let _ = self.lookup_nodes(self.node_id).await;
        } else if !bootstrap.is_empty() {
            warn!("No bootstrap peer reachable, running as initial node");
        }

        info!(node_id = %self.node_id, reached, "DHT join complete");
        reached
    }

    pub async fn add_peer(&self, peer: DhtPeer) {
        if peer.node_id == self.node_id {
            return;
        }
        if let Some(bucket) = self.node_id.bucket_index(&peer.node_id) {
            self.routing.write().await[bucket].upsert(peer);
        }
    }

    pub async fn remove_peer(&self, node_id: &NodeId) {
        if let Some(bucket) = self.node_id.bucket_index(node_id) {
            self.routing.write().await[bucket].remove(node_id);
        }
    }

    async fn closest_peers(&self, target: &NodeId, count: usize) -> Vec<DhtPeer> {
        let routing = self.routing.read().await;
        let mut all: Vec<(NodeId, DhtPeer)> = routing
            .iter()
            .flat_map(|bucket| bucket.peers().cloned())
            .map(|peer| (peer.node_id.distance(target), peer))
            .collect();
        all.sort_by(|a, b| a.0 .0.cmp(&b.0 .0));
        all.into_iter().take(count).map(|(_, peer)| peer).collect()
    }

    /// One query round against the closest known peers for `target`.
    async fn lookup_nodes(&self, target: NodeId) -> Vec<DhtPeer> {
        let candidates = self.closest_peers(&target, ALPHA).await;
        for peer in &candidates {
            let msg = DhtMessage::FindNode {
                sender: self.self_peer(),
                target,
            };
            match self.transport.send(&peer.endpoint, msg).await {
                Ok(Some(DhtMessage::FoundNodes { sender, nodes })) => {
                    self.add_peer(sender).await;
                    for node in nodes {
                        self.add_peer(node).await;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("FindNode to {} failed: {}", peer.endpoint, e);
                    self.remove_peer(&peer.node_id).await;
                }
            }
        }
        self.closest_peers(&target, K_BUCKET_SIZE).await
    }

    /// Store a value locally and replicate it to the closest peers.
    pub async fn put(&self, key: &str, value: DhtValue) {
        self.store_local(key, value.clone()).await;

        let target = NodeId::from_key(key);
        let peers = self.closest_peers(&target, self.settings.replication).await;
        for peer in peers {
            let msg = DhtMessage::Store {
                sender: self.self_peer(),
                key: key.to_string(),
                value: value.clone(),
            };
            if let Err(e) = self.transport.send(&peer.endpoint, msg).await {
                debug!("Store replication to {} failed: {}", peer.endpoint, e);
            }
        }
    }

    /// Look a key up: local store first, then one query round against the
    /// closest peers. Returns `None` on a miss; the caller falls back to
    /// the coordinator path and never blocks on the overlay.
    pub async fn get(&self, key: &str) -> Option<DhtValue> {
        {
            let mut stats = self.stats.write().await;
            stats.lookups += 1;
        }

        if let Some(record) = self.store.read().await.get(key) {
            self.stats.write().await.lookup_hits += 1;
            return Some(record.value.clone());
        }

        let target = NodeId::from_key(key);
        let peers = self.closest_peers(&target, ALPHA).await;
        for peer in peers {
            let msg = DhtMessage::FindValue {
                sender: self.self_peer(),
                key: key.to_string(),
            };
            match self.transport.send(&peer.endpoint, msg).await {
                Ok(Some(DhtMessage::FoundValue { value, closer, sender, .. })) => {
                    self.add_peer(sender).await;
                    for node in closer {
                        self.add_peer(node).await;
                    }
                    if let Some(value) = value {
                        self.store_local(key, value.clone()).await;
                        self.stats.write().await.lookup_hits += 1;
                        return Some(value);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("FindValue to {} failed: {}", peer.endpoint, e);
                    self.remove_peer(&peer.node_id).await;
                }
            }
        }
        None
    }

    async fn store_local(&self, key: &str, value: DhtValue) {
        let mut store = self.store.write().await;

        // Service indexes merge rather than overwrite so concurrent
        // joiners do not clobber each other's entries.
        let mut merged = false;
        if let DhtValue::ServiceIndex { workers: incoming } = &value {
            if let Some(StoredRecord {
                value: DhtValue::ServiceIndex { workers: existing },
                updated_at,
            }) = store.get_mut(key)
            {
                for worker in incoming {
                    if !existing.contains(worker) {
                        existing.push(worker.clone());
                    }
                }
                *updated_at = unix_now();
                merged = true;
            }
        }

        if !merged {
            store.insert(
                key.to_string(),
                StoredRecord {
                    value,
                    updated_at: unix_now(),
                },
            );
        }
    }

    /// Remove a worker id from a locally held service index (graceful
    /// shutdown path; best-effort by contract).
    pub async fn remove_from_service(&self, service: &str, worker_id: &str) {
        let key = service_key(service);
        let mut store = self.store.write().await;
        if let Some(StoredRecord {
            value: DhtValue::ServiceIndex { workers },
            updated_at,
        }) = store.get_mut(&key)
        {
            workers.retain(|w| w != worker_id);
            *updated_at = unix_now();
        }
        drop(store);

        // Push the pruned index to the peers replicating the key.
        let value = {
            let store = self.store.read().await;
            store.get(&key).map(|r| r.value.clone())
        };
        if let Some(value) = value {
            let target = NodeId::from_key(&key);
            for peer in self.closest_peers(&target, self.settings.replication).await {
                let msg = DhtMessage::Store {
                    sender: self.self_peer(),
                    key: key.clone(),
                    value: value.clone(),
                };
                let _ = self.transport.send(&peer.endpoint, msg).await;
            }
        }
    }

    /// Drop worker announcements past the staleness window. Service
    /// indexes are left alone; readers filter them through announcements.
    pub async fn prune(&self) -> usize {
        self.prune_at(unix_now()).await
    }

    pub(crate) async fn prune_at(&self, now: u64) -> usize {
        let cutoff = now.saturating_sub(self.settings.record_staleness_secs);
        let mut store = self.store.write().await;
        let before = store.len();
        store.retain(|_, record| match &record.value {
            DhtValue::Worker(announcement) => announcement.last_seen >= cutoff,
            DhtValue::ServiceIndex { .. } => true,
        });
        before - store.len()
    }

    /// Handle one inbound message, returning the reply (if any). Every
    /// message teaches us its sender.
    pub async fn handle_message(&self, msg: DhtMessage) -> Option<DhtMessage> {
        self.stats.write().await.messages_received += 1;

        match msg {
            DhtMessage::Ping { sender, nonce } => {
                self.add_peer(sender).await;
                Some(DhtMessage::Pong {
                    sender: self.self_peer(),
                    nonce,
                })
            }
            DhtMessage::Pong { sender, .. } => {
                self.add_peer(sender).await;
                None
            }
            DhtMessage::FindNode { sender, target } => {
                self.add_peer(sender).await;
                let nodes = self.closest_peers(&target, K_BUCKET_SIZE).await;
                Some(DhtMessage::FoundNodes {
                    sender: self.self_peer(),
                    nodes,
                })
            }
            DhtMessage::FoundNodes { sender, nodes } => {
                self.add_peer(sender).await;
                for node in nodes {
                    self.add_peer(node).await;
                }
                None
            }
            DhtMessage::Store { sender, key, value } => {
                self.add_peer(sender).await;
                self.store_local(&key, value).await;
                self.stats.write().await.stores_accepted += 1;
                Some(DhtMessage::StoreAck {
                    sender: self.self_peer(),
                    key,
                    accepted: true,
                })
            }
            DhtMessage::FindValue { sender, key } => {
                self.add_peer(sender).await;
                let value = self.store.read().await.get(&key).map(|r| r.value.clone());
                let closer = if value.is_none() {
                    self.closest_peers(&NodeId::from_key(&key), ALPHA).await
                } else {
                    vec![]
                };
                Some(DhtMessage::FoundValue {
                    sender: self.self_peer(),
                    key,
                    value,
                    closer,
                })
            }
            DhtMessage::StoreAck { sender, .. } | DhtMessage::FoundValue { sender, .. } => {
                self.add_peer(sender).await;
                None
            }
        }
    }

    pub async fn stats(&self) -> DhtStats {
        let mut stats = self.stats.read().await.clone();
        let routing = self.routing.read().await;
        stats.known_peers = routing.iter().map(|b| b.peers.len()).sum();
        stats.local_records = self.store.read().await.len();
        stats
    }
}
