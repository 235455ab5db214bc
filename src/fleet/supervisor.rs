//! Failover supervisor.
//!
//! Every keeper classifies the whole fleet from heartbeats on a fixed
//! cadence. Only decisions made while holding the leader lease are
//! authoritative, with one exception: when the lease holder itself is the
//! failed keeper, any supervisor may promote a replacement (the
//! check-and-set write keeps racers safe).

use super::election::LeaderElector;
use super::sharder::WorkSharder;
use crate::config::Config;
use crate::coordination::{keys, CoordStore};
use crate::models::{now_ms, ControlMessage, Heartbeat, KeeperEvent, KeeperInfo};
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, warn};

const DEGRADED_ERROR_RATE: f64 = 0.1;
const DEGRADED_LATENCY_MS: f64 = 5000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failed,
}

/// Classify one keeper from its heartbeat. `heartbeat_ttl_ms` is the failure
/// bound; half of it is the degraded bound.
pub fn classify(heartbeat: Option<&Heartbeat>, now_ms: i64, heartbeat_ttl_ms: i64) -> HealthStatus {
    let Some(hb) = heartbeat else {
        return HealthStatus::Failed;
    };
    let age = now_ms - hb.ts_ms;
    if age > heartbeat_ttl_ms {
        return HealthStatus::Failed;
    }
    if age > heartbeat_ttl_ms / 2 {
        return HealthStatus::Degraded;
    }
    let error_rate = hb.errors as f64 / (hb.processed.max(1)) as f64;
    if error_rate > DEGRADED_ERROR_RATE || hb.latency_ms > DEGRADED_LATENCY_MS {
        return HealthStatus::Degraded;
    }
    HealthStatus::Healthy
}

/// Promotion fitness: perfect health scores 100, errors and latency and
/// existing workload subtract from it.
pub fn promotion_score(error_rate: f64, latency_ms: f64, workload: usize) -> f64 {
    100.0 - 100.0 * error_rate - (latency_ms / 100.0).min(50.0) - (workload as f64 / 10.0).min(20.0)
}

struct KeeperHealth {
    id: String,
    status: HealthStatus,
    heartbeat: Option<Heartbeat>,
}

pub struct FailoverSupervisor {
    store: Arc<dyn CoordStore>,
    sharder: Arc<WorkSharder>,
    elector: Arc<LeaderElector>,
    config: Config,
    consecutive_failures: Mutex<HashMap<String, u32>>,
    currently_failed: Mutex<HashSet<String>>,
}

impl FailoverSupervisor {
    pub fn new(
        store: Arc<dyn CoordStore>,
        sharder: Arc<WorkSharder>,
        elector: Arc<LeaderElector>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            sharder,
            elector,
            config,
            consecutive_failures: Mutex::new(HashMap::new()),
            currently_failed: Mutex::new(HashSet::new()),
        })
    }

    /// One health-check pass over the registry.
    pub async fn tick(self: &Arc<Self>) -> Result<()> {
        let registry = self.store.hash_get_all(keys::REGISTRY).await?;
        let now = now_ms();
        let ttl_ms = self.config.heartbeat_ttl.as_millis() as i64;

        let mut fleet = Vec::with_capacity(registry.len());
        for (keeper_id, info_bytes) in &registry {
            // Last write wins for duplicate registrations; hash semantics
            // already guarantee that.
            if serde_json::from_slice::<KeeperInfo>(info_bytes).is_err() {
                warn!(keeper = %keeper_id, "unparseable registry entry");
            }
            let heartbeat = self.read_heartbeat(keeper_id).await?;
            let status = classify(heartbeat.as_ref(), now, ttl_ms);
            fleet.push(KeeperHealth {
                id: keeper_id.clone(),
                status,
                heartbeat,
            });
        }

        for i in 0..fleet.len() {
            let keeper_id = fleet[i].id.clone();
            match fleet[i].status {
                HealthStatus::Failed => {
                    self.on_failed(&keeper_id, &fleet).await?;
                }
                status => {
                    self.consecutive_failures.lock().remove(&keeper_id);
                    self.currently_failed.lock().remove(&keeper_id);
                    if status == HealthStatus::Degraded {
                        warn!(keeper = %keeper_id, "keeper degraded");
                    }
                }
            }
        }
        Ok(())
    }

    async fn read_heartbeat(&self, keeper_id: &str) -> Result<Option<Heartbeat>> {
        let Some(bytes) = self.store.get(&keys::heartbeat(keeper_id)).await? else {
            return Ok(None);
        };
        Ok(serde_json::from_slice(&bytes).ok())
    }

    async fn on_failed(self: &Arc<Self>, keeper_id: &str, fleet: &[KeeperHealth]) -> Result<()> {
        if keeper_id == self.elector.keeper_id() {
            return Ok(());
        }

        let failures = {
            let mut counters = self.consecutive_failures.lock();
            let count = counters.entry(keeper_id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let newly_failed = self.currently_failed.lock().insert(keeper_id.to_string());

        let lease_holder = self.store.get(keys::LEADER_LOCK).await?;
        let held_lease = lease_holder.as_deref() == Some(keeper_id.as_bytes());

        if newly_failed {
            warn!(keeper = %keeper_id, held_lease, "keeper failed");
            if held_lease {
                // Anyone may replace a dead leader; the CAS write arbitrates.
                self.promote_replacement(keeper_id, fleet).await?;
            } else if self.elector.is_leader() {
                self.redistribute_from(keeper_id).await?;
                self.schedule_recovery_probe(keeper_id.to_string());
            }
        }

        if failures >= self.config.max_consecutive_failures && self.elector.is_leader() {
            self.permanent_failure(keeper_id).await?;
        }
        Ok(())
    }

    /// Pick the best healthy keeper and hand it the lease.
    async fn promote_replacement(&self, failed_id: &str, fleet: &[KeeperHealth]) -> Result<()> {
        let workloads = self
            .sharder
            .load_current()
            .await?
            .unwrap_or_default();

        let best = fleet
            .iter()
            .filter(|k| k.status == HealthStatus::Healthy && k.id != failed_id)
            .map(|k| {
                let (error_rate, latency) = k
                    .heartbeat
                    .as_ref()
                    .map(|hb| {
                        (hb.errors as f64 / hb.processed.max(1) as f64, hb.latency_ms)
                    })
                    .unwrap_or((0.0, 0.0));
                let workload = workloads.get(&k.id).map_or(0, Vec::len);
                (k.id.clone(), promotion_score(error_rate, latency, workload))
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let Some((chosen, score)) = best else {
            error!(failed = %failed_id, "leader failed with no healthy replacement");
            self.publish_event(KeeperEvent::CriticalFailure {
                keeper_id: failed_id.to_string(),
            })
            .await?;
            return Ok(());
        };

        let replaced = self
            .store
            .set_if_present(
                keys::LEADER_LOCK,
                chosen.as_bytes(),
                self.config.lease_ttl,
            )
            .await?;
        if !replaced {
            // Lease expired in the meantime; ordinary election will fill it.
            return Ok(());
        }
        info!(failed = %failed_id, chosen = %chosen, score, "promoted replacement leader");
        self.store
            .publish(
                &keys::control_channel(&chosen),
                &serde_json::to_vec(&ControlMessage::BecomeLeader)?,
            )
            .await?;
        Ok(())
    }

    /// Round-robin the failed keeper's markets across survivors in the
    /// current map, then persist and publish the new distribution.
    async fn redistribute_from(&self, failed_id: &str) -> Result<()> {
        let Some(mut current) = self.sharder.load_current().await? else {
            return Ok(());
        };
        let Some(orphaned) = current.remove(failed_id) else {
            return Ok(());
        };
        let mut survivors: Vec<String> = current.keys().cloned().collect();
        survivors.sort();
        if survivors.is_empty() {
            error!(failed = %failed_id, "no survivors to take over orphaned markets");
            return Ok(());
        }

        for (i, market) in orphaned.into_iter().enumerate() {
            let target = &survivors[i % survivors.len()];
            current.get_mut(target).expect("survivor present").push(market);
        }
        let generation = self.sharder.publish_assignments(&current).await?;
        info!(failed = %failed_id, generation, "redistributed orphaned markets");
        Ok(())
    }

    /// After the recovery timeout, a failed backup with a fresh heartbeat is
    /// reinstated.
    fn schedule_recovery_probe(self: &Arc<Self>, keeper_id: String) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(supervisor.config.recovery_timeout).await;
            let heartbeat = match supervisor.read_heartbeat(&keeper_id).await {
                Ok(hb) => hb,
                Err(e) => {
                    warn!(keeper = %keeper_id, error = %e, "recovery probe failed");
                    return;
                }
            };
            let ttl_ms = supervisor.config.heartbeat_ttl.as_millis() as i64;
            let fresh = heartbeat
                .as_ref()
                .map_or(false, |hb| now_ms() - hb.ts_ms <= ttl_ms);
            if fresh {
                info!(keeper = %keeper_id, "failed keeper recovered");
                supervisor.consecutive_failures.lock().remove(&keeper_id);
                supervisor.currently_failed.lock().remove(&keeper_id);
                let _ = supervisor
                    .publish_event(KeeperEvent::KeeperRecovered { keeper_id })
                    .await;
            }
        });
    }

    /// Escalation terminus: scrub the keeper from the registry. Coming back
    /// requires a fresh registration.
    async fn permanent_failure(&self, keeper_id: &str) -> Result<()> {
        warn!(keeper = %keeper_id, "permanent failure; removing from fleet");
        self.store.hash_del(keys::REGISTRY, keeper_id).await?;
        self.store.del(&keys::heartbeat(keeper_id)).await?;
        self.consecutive_failures.lock().remove(keeper_id);
        self.currently_failed.lock().remove(keeper_id);
        self.publish_event(KeeperEvent::KeeperRemoved {
            keeper_id: keeper_id.to_string(),
        })
        .await
    }

    async fn publish_event(&self, event: KeeperEvent) -> Result<()> {
        self.store
            .publish(keys::EVENTS, &serde_json::to_vec(&event)?)
            .await
    }
}
