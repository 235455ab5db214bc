//! Coordination store abstraction.
//!
//! The fleet shares state through a small KV/pub-sub contract: hash maps for
//! the registry and counters, TTL strings for heartbeats and the leader
//! lease, channels for work and control messages, and a list for the retry
//! queue. Values are opaque bytes; callers encode JSON. Any correct backing
//! store can sit behind this trait; [`memory::InMemoryStore`] is the
//! in-process one.

pub mod memory;

use anyhow::Result;
use std::time::Duration;
use tokio::sync::mpsc;

pub use memory::InMemoryStore;

/// Messages delivered for one channel subscription.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self { rx }
    }

    /// Next message, or `None` once the store side is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }
}

#[async_trait::async_trait]
pub trait CoordStore: Send + Sync {
    // Registry-style hash maps.
    async fn hash_set(&self, map: &str, key: &str, val: &[u8]) -> Result<()>;
    async fn hash_get(&self, map: &str, key: &str) -> Result<Option<Vec<u8>>>;
    async fn hash_del(&self, map: &str, key: &str) -> Result<()>;
    async fn hash_get_all(&self, map: &str) -> Result<Vec<(String, Vec<u8>)>>;

    // TTL strings (heartbeats).
    async fn set_ex(&self, key: &str, val: &[u8], ttl: Duration) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn del(&self, key: &str) -> Result<()>;

    // Leader lease.
    async fn set_if_absent(&self, key: &str, val: &[u8], ttl: Duration) -> Result<bool>;
    async fn set_if_present(&self, key: &str, val: &[u8], ttl: Duration) -> Result<bool>;
    async fn extend(&self, key: &str, ttl: Duration) -> Result<()>;

    // Work and control messages.
    async fn publish(&self, channel: &str, msg: &[u8]) -> Result<()>;
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    // Retry queue.
    async fn list_push(&self, queue: &str, msg: &[u8]) -> Result<()>;
    async fn list_pop(&self, queue: &str) -> Result<Option<Vec<u8>>>;

    // Shared counters.
    async fn increment_by(&self, hash: &str, key: &str, delta: i64) -> Result<i64>;

    /// Cheap reachability probe; failing marks the keeper unhealthy.
    async fn ping(&self) -> Result<()>;
}

/// Well-known key names shared by every keeper.
pub mod keys {
    pub const REGISTRY: &str = "keepers:registry";
    pub const LEADER_LOCK: &str = "keeper:leader:lock";
    pub const EVENTS: &str = "keeper:events";
    pub const WORK_DISTRIBUTION: &str = "keeper:work:distribution";
    pub const PROGRESS: &str = "keeper:progress";
    pub const ERRORS: &str = "keeper:errors";
    pub const RETRY_QUEUE: &str = "keeper:retry:queue";

    /// Field inside [`WORK_DISTRIBUTION`] holding the assignment map.
    pub const DISTRIBUTION_CURRENT: &str = "current";
    /// Field inside [`WORK_DISTRIBUTION`] holding the publish timestamp.
    pub const DISTRIBUTION_TIMESTAMP: &str = "timestamp";
    /// Field inside [`WORK_DISTRIBUTION`] holding the generation counter.
    pub const DISTRIBUTION_GENERATION: &str = "generation";

    pub fn heartbeat(keeper_id: &str) -> String {
        format!("keeper:{keeper_id}:heartbeat")
    }

    pub fn work_channel(keeper_id: &str) -> String {
        format!("keeper:{keeper_id}:work")
    }

    pub fn control_channel(keeper_id: &str) -> String {
        format!("keeper:{keeper_id}:control")
    }
}
