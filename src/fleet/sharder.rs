//! Work sharding.
//!
//! The leader maps every market to exactly one keeper with a deterministic
//! string hash, persists the whole distribution as a single value, and
//! publishes each keeper's list on its work channel with a strictly
//! increasing generation drawn from a shared counter.

use crate::coordination::{keys, CoordStore};
use crate::models::{now_ms, WorkMessage};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

/// 31-based string hash over UTF-16 code units, 32-bit wrapping, absolute
/// value. Stable across every keeper, which is all that matters here.
pub fn shard_hash(s: &str) -> u64 {
    let mut hash: i32 = 0;
    for code_unit in s.encode_utf16() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(code_unit as i32);
    }
    (hash as i64).unsigned_abs()
}

/// Deterministic market -> keeper partition. Keeper order is normalized by
/// sorting so every node computes the same map.
pub fn compute_assignments(
    keepers: &[String],
    markets: &[String],
) -> HashMap<String, Vec<String>> {
    let mut sorted_keepers: Vec<&String> = keepers.iter().collect();
    sorted_keepers.sort();
    sorted_keepers.dedup();

    let mut assignments: HashMap<String, Vec<String>> = sorted_keepers
        .iter()
        .map(|k| ((*k).clone(), Vec::new()))
        .collect();
    if sorted_keepers.is_empty() {
        return assignments;
    }

    for market in markets {
        let slot = (shard_hash(market) % sorted_keepers.len() as u64) as usize;
        assignments
            .get_mut(sorted_keepers[slot].as_str())
            .expect("slot keeper present")
            .push(market.clone());
    }
    assignments
}

pub struct WorkSharder {
    store: Arc<dyn CoordStore>,
}

impl WorkSharder {
    pub fn new(store: Arc<dyn CoordStore>) -> Self {
        Self { store }
    }

    /// Compute and publish a fresh distribution. An empty keeper set
    /// publishes nothing; an empty market universe still publishes (empty)
    /// lists and bumps the generation.
    pub async fn reshard(&self, keepers: &[String], markets: &[String]) -> Result<Option<u64>> {
        if keepers.is_empty() {
            error!("no active keepers; cannot distribute work");
            return Ok(None);
        }
        let assignments = compute_assignments(keepers, markets);
        let generation = self.publish_assignments(&assignments).await?;
        info!(
            keepers = keepers.len(),
            markets = markets.len(),
            generation,
            "published work distribution"
        );
        Ok(Some(generation))
    }

    /// Persist the map as one value and publish per-keeper lists. Returns
    /// the generation used.
    pub async fn publish_assignments(
        &self,
        assignments: &HashMap<String, Vec<String>>,
    ) -> Result<u64> {
        let generation = self
            .store
            .increment_by(keys::WORK_DISTRIBUTION, keys::DISTRIBUTION_GENERATION, 1)
            .await? as u64;
        let ts = now_ms();

        // Whole-value write; the store offers no multi-key transaction.
        let snapshot: Vec<(&String, &Vec<String>)> = assignments.iter().collect();
        self.store
            .hash_set(
                keys::WORK_DISTRIBUTION,
                keys::DISTRIBUTION_CURRENT,
                &serde_json::to_vec(&snapshot)?,
            )
            .await?;
        self.store
            .hash_set(
                keys::WORK_DISTRIBUTION,
                keys::DISTRIBUTION_TIMESTAMP,
                ts.to_string().as_bytes(),
            )
            .await?;

        for (keeper_id, markets) in assignments {
            let message = WorkMessage {
                markets: markets.clone(),
                ts,
                generation,
            };
            self.store
                .publish(&keys::work_channel(keeper_id), &serde_json::to_vec(&message)?)
                .await?;
        }
        Ok(generation)
    }

    /// The persisted distribution, if any.
    pub async fn load_current(&self) -> Result<Option<HashMap<String, Vec<String>>>> {
        let Some(bytes) = self
            .store
            .hash_get(keys::WORK_DISTRIBUTION, keys::DISTRIBUTION_CURRENT)
            .await?
        else {
            return Ok(None);
        };
        let pairs: Vec<(String, Vec<String>)> = serde_json::from_slice(&bytes)?;
        Ok(Some(pairs.into_iter().collect()))
    }
}
