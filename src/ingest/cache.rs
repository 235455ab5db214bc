//! Price cache.
//!
//! Latest observed yes-price per market, bounded by size and age with LRU
//! eviction. An entry is "hot" when observed within the hot window. Stale
//! observations (older than what is already cached) never overwrite.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct CachedPrice {
    pub last_yes_price: f64,
    pub observed_at_ms: i64,
}

/// Outcome of recording an observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// First price seen for this market.
    Seeded,
    /// Older than the cached observation; dropped.
    Stale,
    /// Applied; carries the previous price.
    Updated { previous: f64 },
}

struct CacheInner {
    entries: HashMap<String, CachedPrice>,
    // Observation order for eviction; stale records are skipped lazily.
    order: VecDeque<(String, i64)>,
}

pub struct PriceCache {
    capacity: usize,
    max_age: Duration,
    inner: Mutex<CacheInner>,
}

impl PriceCache {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            capacity,
            max_age,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Record an observation, keeping per-market ordering by `observed_at`.
    pub fn observe(&self, market_id: &str, yes_price: f64, observed_at_ms: i64) -> Observation {
        let mut inner = self.inner.lock();
        let outcome = match inner.entries.get(market_id) {
            None => Observation::Seeded,
            Some(existing) if observed_at_ms < existing.observed_at_ms => {
                return Observation::Stale;
            }
            Some(existing) => Observation::Updated {
                previous: existing.last_yes_price,
            },
        };

        inner.entries.insert(
            market_id.to_string(),
            CachedPrice {
                last_yes_price: yes_price,
                observed_at_ms,
            },
        );
        inner.order.push_back((market_id.to_string(), observed_at_ms));
        self.evict(&mut inner, observed_at_ms);
        outcome
    }

    pub fn get(&self, market_id: &str) -> Option<CachedPrice> {
        self.inner.lock().entries.get(market_id).copied()
    }

    /// Markets observed within `window`, most recent first, capped at
    /// `limit`.
    pub fn hot_markets(&self, window: Duration, limit: usize) -> Vec<String> {
        let now = crate::models::now_ms();
        let window_ms = window.as_millis() as i64;
        let inner = self.inner.lock();
        let mut hot: Vec<(&String, i64)> = inner
            .entries
            .iter()
            .filter(|(_, price)| now - price.observed_at_ms <= window_ms)
            .map(|(id, price)| (id, price.observed_at_ms))
            .collect();
        hot.sort_by(|a, b| b.1.cmp(&a.1));
        hot.into_iter().take(limit).map(|(id, _)| id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    fn evict(&self, inner: &mut CacheInner, now_ms: i64) {
        let max_age_ms = self.max_age.as_millis() as i64;
        while inner.entries.len() > self.capacity || self.front_expired(inner, now_ms, max_age_ms) {
            let Some((id, recorded_ts)) = inner.order.pop_front() else {
                break;
            };
            match inner.entries.get(&id) {
                // Only drop the entry if this order record is its newest one.
                Some(price) if price.observed_at_ms == recorded_ts => {
                    inner.entries.remove(&id);
                }
                _ => {}
            }
        }
    }

    fn front_expired(&self, inner: &CacheInner, now_ms: i64, max_age_ms: i64) -> bool {
        inner
            .order
            .front()
            .map_or(false, |(_, ts)| now_ms - ts > max_age_ms)
    }
}
