//! Keeper process: lifecycle, heartbeats, work intake, retry drain.

pub mod node;
pub mod retry;

pub use node::{KeeperNode, KeeperState};
pub use retry::RetryDrainer;

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared work counters, bumped by the ingestion engine and reported by the
/// heartbeat task.
#[derive(Debug, Default)]
pub struct ProgressCounters {
    processed: AtomicU64,
    errors: AtomicU64,
    queue_depth: AtomicU64,
    latency_ms: AtomicU64,
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_processed(&self, n: u64) {
        self.processed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, depth: u64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> u64 {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// Latest on-chain publish latency.
    pub fn record_latency(&self, ms: u64) {
        self.latency_ms.store(ms, Ordering::Relaxed);
    }

    pub fn latency_ms(&self) -> u64 {
        self.latency_ms.load(Ordering::Relaxed)
    }
}
