//! Keeper node lifecycle.
//!
//! A keeper registers itself, heartbeats under a TTL key, listens for work
//! and control messages, reports progress to the shared counters, and runs
//! the election and failover loops. Timer tasks are independent: one
//! stalling does not delay the others.

use super::retry::RetryDrainer;
use super::ProgressCounters;
use crate::config::Config;
use crate::coordination::{keys, CoordStore};
use crate::fleet::{FailoverSupervisor, LeaderElector, WorkSharder};
use crate::ingest::IngestionEngine;
use crate::models::{
    now_ms, ControlMessage, Heartbeat, KeeperInfo, ResourceSnapshot, WorkMessage,
};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use sysinfo::System;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeeperState {
    Starting,
    Registered,
    Leader,
    Follower,
    Stopping,
    Stopped,
}

pub struct KeeperNode {
    id: String,
    config: Config,
    store: Arc<dyn CoordStore>,
    elector: Arc<LeaderElector>,
    sharder: Arc<WorkSharder>,
    supervisor: Arc<FailoverSupervisor>,
    engine: Arc<IngestionEngine>,
    counters: Arc<ProgressCounters>,

    state: Mutex<KeeperState>,
    accepted_generation: AtomicU64,
    store_healthy: AtomicBool,
    /// (processed, errors) already pushed to the shared counters.
    reported: Mutex<(u64, u64)>,
    system: Mutex<System>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl KeeperNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: &str,
        config: Config,
        store: Arc<dyn CoordStore>,
        elector: Arc<LeaderElector>,
        sharder: Arc<WorkSharder>,
        supervisor: Arc<FailoverSupervisor>,
        engine: Arc<IngestionEngine>,
        counters: Arc<ProgressCounters>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            config,
            store,
            elector,
            sharder,
            supervisor,
            engine,
            counters,
            state: Mutex::new(KeeperState::Starting),
            accepted_generation: AtomicU64::new(0),
            store_healthy: AtomicBool::new(true),
            reported: Mutex::new((0, 0)),
            system: Mutex::new(System::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> KeeperState {
        *self.state.lock()
    }

    pub fn is_leader(&self) -> bool {
        self.elector.is_leader()
    }

    pub fn accepted_generation(&self) -> u64 {
        self.accepted_generation.load(Ordering::SeqCst)
    }

    /// Register, start every background loop, and run the first election.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!(keeper = %self.id, host = %self.config.host, "keeper starting");
        self.register().await.context("keeper registration")?;
        *self.state.lock() = KeeperState::Registered;

        self.spawn_heartbeat();
        self.spawn_work_listener().await?;
        self.spawn_control_listener().await?;

        // First election attempt, then periodic re-verify.
        if self.elector.try_acquire().await.unwrap_or(false) {
            *self.state.lock() = KeeperState::Leader;
            self.reshard_now().await;
        } else {
            *self.state.lock() = KeeperState::Follower;
        }
        self.spawn_leader_loop();
        self.spawn_reshard_loop();
        self.spawn_supervisor_loop();
        self.spawn_retry_drainer();

        info!(keeper = %self.id, leader = self.is_leader(), "keeper started");
        Ok(())
    }

    /// Cancel the loops, give up the lease, and deregister.
    pub async fn stop(self: &Arc<Self>) -> Result<()> {
        *self.state.lock() = KeeperState::Stopping;
        info!(keeper = %self.id, "keeper stopping");

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        // Lease release is check-and-set: only our own value is deleted.
        if let Err(e) = self.elector.release().await {
            warn!(error = %e, "lease release failed");
        }
        let _ = self.store.hash_del(keys::REGISTRY, &self.id).await;
        let _ = self.store.del(&keys::heartbeat(&self.id)).await;

        *self.state.lock() = KeeperState::Stopped;
        Ok(())
    }

    async fn register(&self) -> Result<()> {
        let info = KeeperInfo {
            id: self.id.clone(),
            started_at_ms: now_ms(),
            capabilities: self.config.capabilities.clone(),
            host: self.config.host.clone(),
            last_heartbeat_ms: now_ms(),
            assignment: Vec::new(),
        };
        self.store
            .hash_set(keys::REGISTRY, &self.id, &serde_json::to_vec(&info)?)
            .await
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let node = self.clone();
        self.tasks.lock().push(tokio::spawn(async move {
            let mut tick = interval(node.config.heartbeat_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if let Err(e) = node.heartbeat_once().await {
                    // Unreachable store: stop publishing, keep serving reads.
                    if node.store_healthy.swap(false, Ordering::SeqCst) {
                        error!(error = %e, "coordination store unreachable; heartbeats paused");
                    }
                } else if !node.store_healthy.swap(true, Ordering::SeqCst) {
                    info!("coordination store reachable again");
                }
            }
        }));
    }

    async fn heartbeat_once(&self) -> Result<()> {
        self.store.ping().await?;

        let resources = {
            let mut system = self.system.lock();
            system.refresh_memory();
            system.refresh_cpu_usage();
            ResourceSnapshot {
                cpu_percent: system.global_cpu_usage(),
                mem_used_mb: system.used_memory() / 1024 / 1024,
            }
        };
        let heartbeat = Heartbeat {
            ts_ms: now_ms(),
            processed: self.counters.processed(),
            errors: self.counters.errors(),
            queue_depth: self.counters.queue_depth(),
            latency_ms: self.counters.latency_ms() as f64,
            resources,
        };
        self.store
            .set_ex(
                &keys::heartbeat(&self.id),
                &serde_json::to_vec(&heartbeat)?,
                self.config.heartbeat_ttl,
            )
            .await?;

        // Refresh lastHeartbeat inside the registry entry (whole-value write).
        if let Some(bytes) = self.store.hash_get(keys::REGISTRY, &self.id).await? {
            if let Ok(mut info) = serde_json::from_slice::<KeeperInfo>(&bytes) {
                info.last_heartbeat_ms = heartbeat.ts_ms;
                self.store
                    .hash_set(keys::REGISTRY, &self.id, &serde_json::to_vec(&info)?)
                    .await?;
            }
        }

        self.report_progress().await
    }

    /// Push counter deltas since the last beat into the shared hashes.
    async fn report_progress(&self) -> Result<()> {
        let (processed, errors) = (self.counters.processed(), self.counters.errors());
        let (processed_delta, errors_delta) = {
            let mut reported = self.reported.lock();
            let delta = (
                processed.saturating_sub(reported.0),
                errors.saturating_sub(reported.1),
            );
            *reported = (processed, errors);
            delta
        };
        if processed_delta > 0 {
            self.store
                .increment_by(keys::PROGRESS, &self.id, processed_delta as i64)
                .await?;
        }
        if errors_delta > 0 {
            self.store
                .increment_by(keys::ERRORS, &self.id, errors_delta as i64)
                .await?;
        }
        Ok(())
    }

    async fn spawn_work_listener(self: &Arc<Self>) -> Result<()> {
        let mut subscription = self.store.subscribe(&keys::work_channel(&self.id)).await?;
        let node = self.clone();
        self.tasks.lock().push(tokio::spawn(async move {
            while let Some(bytes) = subscription.recv().await {
                node.handle_work_message(&bytes);
            }
        }));
        Ok(())
    }

    /// Accept an assignment only when its generation advances; older ones
    /// never overwrite newer ones.
    pub fn handle_work_message(&self, bytes: &[u8]) {
        let message: WorkMessage = match serde_json::from_slice(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "dropping unparseable work assignment");
                self.counters.record_error();
                return;
            }
        };

        let accepted = self.accepted_generation.load(Ordering::SeqCst);
        if message.generation <= accepted {
            info!(
                generation = message.generation,
                accepted, "ignoring stale work assignment"
            );
            return;
        }
        self.accepted_generation
            .store(message.generation, Ordering::SeqCst);
        info!(
            generation = message.generation,
            markets = message.markets.len(),
            "accepted work assignment"
        );
        self.engine.set_assignment(message.markets);
    }

    async fn spawn_control_listener(self: &Arc<Self>) -> Result<()> {
        let mut subscription = self
            .store
            .subscribe(&keys::control_channel(&self.id))
            .await?;
        let node = self.clone();
        self.tasks.lock().push(tokio::spawn(async move {
            while let Some(bytes) = subscription.recv().await {
                let message: ControlMessage = match serde_json::from_slice(&bytes) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(error = %e, "dropping unparseable control message");
                        continue;
                    }
                };
                match message {
                    ControlMessage::BecomeLeader => {
                        info!(keeper = %node.id, "promotion requested");
                        if node.elector.try_acquire().await.unwrap_or(false) {
                            *node.state.lock() = KeeperState::Leader;
                            node.reshard_now().await;
                        }
                    }
                    ControlMessage::Shutdown => {
                        warn!(keeper = %node.id, "shutdown requested");
                        // stop() aborts this task; run it elsewhere so the
                        // cleanup awaits survive.
                        let stopping = node.clone();
                        tokio::spawn(async move {
                            let _ = stopping.stop().await;
                        });
                        return;
                    }
                }
            }
        }));
        Ok(())
    }

    fn spawn_leader_loop(self: &Arc<Self>) {
        let node = self.clone();
        self.tasks.lock().push(tokio::spawn(async move {
            let mut tick = interval(node.config.leader_verify_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let was_leader = node.elector.is_leader();
                match node.elector.maintain().await {
                    Ok(is_leader) => {
                        {
                            let mut state = node.state.lock();
                            if matches!(*state, KeeperState::Leader | KeeperState::Follower) {
                                *state = if is_leader {
                                    KeeperState::Leader
                                } else {
                                    KeeperState::Follower
                                };
                            }
                        }
                        if is_leader && !was_leader {
                            node.reshard_now().await;
                        }
                    }
                    Err(e) => warn!(error = %e, "leader re-verify failed"),
                }
            }
        }));
    }

    fn spawn_reshard_loop(self: &Arc<Self>) {
        let node = self.clone();
        self.tasks.lock().push(tokio::spawn(async move {
            let mut tick = interval(node.config.reshard_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if node.elector.is_leader() {
                    node.reshard_now().await;
                }
            }
        }));
    }

    /// Leader duty: enumerate active keepers and publish a fresh
    /// distribution over the known market universe.
    pub async fn reshard_now(&self) {
        let active = match self.active_keepers().await {
            Ok(active) => active,
            Err(e) => {
                warn!(error = %e, "cannot enumerate active keepers");
                return;
            }
        };
        let markets = self.engine.market_universe();
        if let Err(e) = self.sharder.reshard(&active, &markets).await {
            warn!(error = %e, "reshard failed");
        }
    }

    /// Keepers with a live heartbeat within the TTL.
    async fn active_keepers(&self) -> Result<Vec<String>> {
        let registry = self.store.hash_get_all(keys::REGISTRY).await?;
        let ttl_ms = self.config.heartbeat_ttl.as_millis() as i64;
        let now = now_ms();
        let mut active = Vec::new();
        for (keeper_id, _) in registry {
            if let Some(bytes) = self.store.get(&keys::heartbeat(&keeper_id)).await? {
                if let Ok(hb) = serde_json::from_slice::<Heartbeat>(&bytes) {
                    if now - hb.ts_ms <= ttl_ms {
                        active.push(keeper_id);
                    }
                }
            }
        }
        Ok(active)
    }

    fn spawn_supervisor_loop(self: &Arc<Self>) {
        let node = self.clone();
        self.tasks.lock().push(tokio::spawn(async move {
            let mut tick = interval(node.config.health_check_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if let Err(e) = node.supervisor.tick().await {
                    warn!(error = %e, "health check tick failed");
                }
            }
        }));
    }

    fn spawn_retry_drainer(self: &Arc<Self>) {
        let drainer = RetryDrainer::new(
            self.store.clone(),
            self.engine.clone(),
            self.sharder.clone(),
            self.id.clone(),
        );
        let node = self.clone();
        self.tasks.lock().push(tokio::spawn(async move {
            let mut tick = interval(node.config.retry_drain_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if let Err(e) = drainer.drain_once().await {
                    warn!(error = %e, "retry drain tick failed");
                }
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::RecordingChainSink;
    use crate::config::Tier;
    use crate::coordination::InMemoryStore;
    use crate::provider::ProviderRestClient;
    use crate::ratelimit::{TieredRateLimiter, UsageMonitor};
    use std::time::Duration;

    async fn node_fixture(store: Arc<InMemoryStore>, id: &str) -> Arc<KeeperNode> {
        let config = Config::from_env().unwrap();
        let monitor = Arc::new(UsageMonitor::new(Duration::from_secs(10)));
        let limiter = TieredRateLimiter::spawn(Tier::Premium.limits(), monitor);
        let rest =
            ProviderRestClient::new("http://localhost:1", Duration::from_secs(1), limiter).unwrap();
        let counters = Arc::new(ProgressCounters::new());
        let engine = IngestionEngine::new(
            config.clone(),
            rest,
            Arc::new(RecordingChainSink::new()),
            store.clone(),
            id,
            counters.clone(),
        );
        let elector = Arc::new(LeaderElector::new(
            store.clone() as Arc<dyn CoordStore>,
            id,
            config.lease_ttl,
        ));
        let sharder = Arc::new(WorkSharder::new(store.clone()));
        let supervisor =
            FailoverSupervisor::new(store.clone(), sharder.clone(), elector.clone(), config.clone());
        KeeperNode::new(id, config, store, elector, sharder, supervisor, engine, counters)
    }

    #[tokio::test]
    async fn start_registers_and_elects_single_node() {
        let store = Arc::new(InMemoryStore::new());
        let node = node_fixture(store.clone(), "k1").await;
        node.start().await.unwrap();

        assert_eq!(node.state(), KeeperState::Leader);
        let registry = store.hash_get_all(keys::REGISTRY).await.unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry[0].0, "k1");

        node.stop().await.unwrap();
        assert_eq!(node.state(), KeeperState::Stopped);
        assert!(store.hash_get_all(keys::REGISTRY).await.unwrap().is_empty());
        assert_eq!(store.get(keys::LEADER_LOCK).await.unwrap(), None);
    }

    #[tokio::test]
    async fn second_node_becomes_follower() {
        let store = Arc::new(InMemoryStore::new());
        let a = node_fixture(store.clone(), "a").await;
        let b = node_fixture(store.clone(), "b").await;
        a.start().await.unwrap();
        b.start().await.unwrap();
        assert_eq!(a.state(), KeeperState::Leader);
        assert_eq!(b.state(), KeeperState::Follower);
        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn work_messages_gate_on_generation() {
        let store = Arc::new(InMemoryStore::new());
        let node = node_fixture(store, "k1").await;

        let msg = |generation: u64, markets: Vec<&str>| {
            serde_json::to_vec(&WorkMessage {
                markets: markets.into_iter().map(String::from).collect(),
                ts: now_ms(),
                generation,
            })
            .unwrap()
        };

        node.handle_work_message(&msg(2, vec!["m1", "m2"]));
        assert_eq!(node.accepted_generation(), 2);

        // Older generation is ignored.
        node.handle_work_message(&msg(1, vec!["m9"]));
        assert_eq!(node.accepted_generation(), 2);

        // Equal generation is ignored too.
        node.handle_work_message(&msg(2, vec!["m9"]));
        assert_eq!(node.accepted_generation(), 2);

        node.handle_work_message(&msg(3, vec!["m3"]));
        assert_eq!(node.accepted_generation(), 3);
    }

    #[tokio::test]
    async fn malformed_work_message_counts_an_error() {
        let store = Arc::new(InMemoryStore::new());
        let node = node_fixture(store, "k1").await;
        let before = node.counters.errors();
        node.handle_work_message(b"{not json");
        assert_eq!(node.counters.errors(), before + 1);
        assert_eq!(node.accepted_generation(), 0);
    }

    #[tokio::test]
    async fn heartbeat_writes_ttl_key_and_counters() {
        let store = Arc::new(InMemoryStore::new());
        let node = node_fixture(store.clone(), "k1").await;
        node.register().await.unwrap();
        node.counters.record_processed(5);
        node.counters.record_error();

        node.heartbeat_once().await.unwrap();

        let hb: Heartbeat =
            serde_json::from_slice(&store.get(&keys::heartbeat("k1")).await.unwrap().unwrap())
                .unwrap();
        assert_eq!(hb.processed, 5);
        assert_eq!(hb.errors, 1);
        assert_eq!(
            store
                .increment_by(keys::PROGRESS, "k1", 0)
                .await
                .unwrap(),
            5
        );
        assert_eq!(store.increment_by(keys::ERRORS, "k1", 0).await.unwrap(), 1);

        // Second beat with no new work pushes no further deltas.
        node.heartbeat_once().await.unwrap();
        assert_eq!(
            store
                .increment_by(keys::PROGRESS, "k1", 0)
                .await
                .unwrap(),
            5
        );
    }
}
