//! Rate-limit compliance surface.
//!
//! The monitor accumulates per-endpoint usage over a sliding window; the
//! checker compares those counters to the provider's published limits and
//! emits violation records. The monitor is passed around as an explicit
//! dependency; there is no process-wide instance.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::warn;

/// Sliding-window usage counters per endpoint.
pub struct UsageMonitor {
    window: Duration,
    hits: Mutex<HashMap<String, VecDeque<i64>>>,
}

impl UsageMonitor {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, endpoint: &str) {
        let now = crate::models::now_ms();
        let window_ms = self.window.as_millis() as i64;
        let mut hits = self.hits.lock();
        let entry = hits.entry(endpoint.to_string()).or_default();
        while let Some(&front) = entry.front() {
            if now - front > window_ms {
                entry.pop_front();
            } else {
                break;
            }
        }
        entry.push_back(now);
    }

    /// Calls to `endpoint` within the current window.
    pub fn usage(&self, endpoint: &str) -> u32 {
        let now = crate::models::now_ms();
        let window_ms = self.window.as_millis() as i64;
        let hits = self.hits.lock();
        hits.get(endpoint)
            .map(|v| v.iter().filter(|&&ts| now - ts <= window_ms).count() as u32)
            .unwrap_or(0)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn snapshot(&self) -> Vec<(String, u32)> {
        let now = crate::models::now_ms();
        let window_ms = self.window.as_millis() as i64;
        let hits = self.hits.lock();
        hits.iter()
            .map(|(endpoint, v)| {
                let count = v.iter().filter(|&&ts| now - ts <= window_ms).count() as u32;
                (endpoint.clone(), count)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComplianceViolation {
    pub ts: i64,
    pub endpoint: String,
    pub count: u32,
    pub window_ms: u64,
    pub limit: u32,
}

/// Compares observed usage to per-endpoint limits.
pub struct ComplianceChecker {
    limits: HashMap<&'static str, u32>,
    default_limit: u32,
}

impl ComplianceChecker {
    pub fn new() -> Self {
        let mut limits = HashMap::new();
        limits.insert("/markets", 50);
        limits.insert("/orders", 100);
        limits.insert("/resolutions", 10);
        Self {
            limits,
            default_limit: 50,
        }
    }

    pub fn limit_for(&self, endpoint: &str) -> u32 {
        self.limits.get(endpoint).copied().unwrap_or(self.default_limit)
    }

    /// Compare every endpoint the monitor has seen against its limit.
    pub fn check(&self, monitor: &UsageMonitor) -> Vec<ComplianceViolation> {
        let now = crate::models::now_ms();
        let window_ms = monitor.window().as_millis() as u64;
        let mut violations = Vec::new();
        for (endpoint, count) in monitor.snapshot() {
            let limit = self.limit_for(&endpoint);
            if count > limit {
                warn!(endpoint, count, limit, "rate limit compliance violation");
                violations.push(ComplianceViolation {
                    ts: now,
                    endpoint,
                    count,
                    window_ms,
                    limit,
                });
            }
        }
        violations
    }
}

impl Default for ComplianceChecker {
    fn default() -> Self {
        Self::new()
    }
}
