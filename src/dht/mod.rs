//! # Distributed Hash Table
//!
//! Kademlia-style overlay for decentralized service discovery. Entries are
//! advisory: every consumer keeps a coordinator-path fallback, and readers
//! filter stale announcements rather than trusting the index.

pub mod node;
pub mod resolver;

pub use node::{
    service_key, worker_key, DhtMessage, DhtNode, DhtPeer, DhtStats, DhtTransport, DhtValue,
    HttpDhtTransport, NodeId, WorkerAnnouncement,
};
pub use resolver::{DhtResolver, ResolveMiss};
