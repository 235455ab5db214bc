//! Fleet scenario tests.
//!
//! End-to-end behavior against the in-process coordination store, with
//! timing compressed so the suite stays fast: leases, heartbeats and health
//! checks run on millisecond scales here.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use versekeeper::chain::RecordingChainSink;
use versekeeper::config::{ClassLimit, Config, TierLimits};
use versekeeper::coordination::{keys, CoordStore, InMemoryStore};
use versekeeper::fleet::{FailoverSupervisor, LeaderElector, WorkSharder};
use versekeeper::ingest::IngestionEngine;
use versekeeper::keeper::{KeeperNode, ProgressCounters};
use versekeeper::models::{now_ms, Heartbeat, PriceUpdate, ResourceSnapshot};
use versekeeper::optimizer::{BatchPayload, BatchTransport, RequestBatcher, RequestDeduplicator};
use versekeeper::provider::ProviderRestClient;
use versekeeper::ratelimit::{RequestError, TieredRateLimiter, UsageMonitor};

fn fast_config() -> Config {
    let mut config = Config::from_env().unwrap();
    config.heartbeat_interval = Duration::from_millis(100);
    config.heartbeat_ttl = Duration::from_millis(800);
    config.lease_ttl = Duration::from_millis(800);
    config.leader_verify_interval = Duration::from_millis(150);
    config.reshard_interval = Duration::from_millis(300);
    config.health_check_interval = Duration::from_millis(150);
    config.recovery_timeout = Duration::from_millis(300);
    config.retry_drain_interval = Duration::from_millis(200);
    config
}

fn build_node(store: Arc<InMemoryStore>, id: &str, config: Config) -> Arc<KeeperNode> {
    let monitor = Arc::new(UsageMonitor::new(Duration::from_secs(10)));
    let limiter = TieredRateLimiter::spawn(config.tier.limits(), monitor);
    let rest =
        ProviderRestClient::new("http://localhost:1", Duration::from_secs(1), limiter).unwrap();
    let counters = Arc::new(ProgressCounters::new());
    let engine = IngestionEngine::new(
        config.clone(),
        rest,
        Arc::new(RecordingChainSink::new()),
        store.clone() as Arc<dyn CoordStore>,
        id,
        counters.clone(),
    );
    let elector = Arc::new(LeaderElector::new(
        store.clone() as Arc<dyn CoordStore>,
        id,
        config.lease_ttl,
    ));
    let sharder = Arc::new(WorkSharder::new(store.clone() as Arc<dyn CoordStore>));
    let supervisor = FailoverSupervisor::new(
        store.clone() as Arc<dyn CoordStore>,
        sharder.clone(),
        elector.clone(),
        config.clone(),
    );
    KeeperNode::new(
        id,
        config,
        store as Arc<dyn CoordStore>,
        elector,
        sharder,
        supervisor,
        engine,
        counters,
    )
}

async fn read_generation(store: &InMemoryStore) -> i64 {
    store
        .increment_by(keys::WORK_DISTRIBUTION, keys::DISTRIBUTION_GENERATION, 0)
        .await
        .unwrap()
}

#[tokio::test]
async fn steady_state_has_exactly_one_leader() {
    let store = Arc::new(InMemoryStore::new());
    let nodes: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|id| build_node(store.clone(), id, fast_config()))
        .collect();
    for node in &nodes {
        node.start().await.unwrap();
    }

    // Two lease TTLs of settling time.
    tokio::time::sleep(Duration::from_millis(1600)).await;

    let leaders: Vec<_> = nodes.iter().filter(|n| n.is_leader()).collect();
    assert_eq!(leaders.len(), 1, "exactly one steady-state leader");

    for node in &nodes {
        node.stop().await.unwrap();
    }
}

#[tokio::test]
async fn leader_handoff_elects_a_survivor_with_higher_generation() {
    let store = Arc::new(InMemoryStore::new());
    let a = build_node(store.clone(), "a", fast_config());
    let b = build_node(store.clone(), "b", fast_config());
    let c = build_node(store.clone(), "c", fast_config());
    a.start().await.unwrap();
    assert!(a.is_leader());
    b.start().await.unwrap();
    c.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let generation_before = read_generation(&store).await;

    a.stop().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let survivors = [&b, &c];
    let leaders: Vec<_> = survivors.iter().filter(|n| n.is_leader()).collect();
    assert_eq!(leaders.len(), 1, "one survivor took over");
    assert!(
        read_generation(&store).await > generation_before,
        "new leader published a fresher distribution"
    );

    b.stop().await.unwrap();
    c.stop().await.unwrap();
}

#[tokio::test]
async fn failed_keeper_work_lands_exactly_once_on_survivor() {
    let store = Arc::new(InMemoryStore::new());
    let mut config = fast_config();
    config.max_consecutive_failures = 100; // keep "a" in the map during the test

    // "b" is the live leader-supervisor; "a" is registered but silent.
    let elector = Arc::new(LeaderElector::new(
        store.clone() as Arc<dyn CoordStore>,
        "b",
        config.lease_ttl,
    ));
    elector.try_acquire().await.unwrap();
    let sharder = Arc::new(WorkSharder::new(store.clone() as Arc<dyn CoordStore>));
    let supervisor = FailoverSupervisor::new(
        store.clone() as Arc<dyn CoordStore>,
        sharder.clone(),
        elector,
        config.clone(),
    );

    for id in ["a", "b"] {
        let info = versekeeper::models::KeeperInfo {
            id: id.to_string(),
            started_at_ms: now_ms(),
            capabilities: vec![],
            host: "test".into(),
            last_heartbeat_ms: now_ms(),
            assignment: vec![],
        };
        store
            .hash_set(keys::REGISTRY, id, &serde_json::to_vec(&info).unwrap())
            .await
            .unwrap();
    }
    // Only "b" heartbeats.
    let hb = Heartbeat {
        ts_ms: now_ms(),
        processed: 100,
        errors: 0,
        queue_depth: 0,
        latency_ms: 5.0,
        resources: ResourceSnapshot::default(),
    };
    store
        .set_ex(
            &keys::heartbeat("b"),
            &serde_json::to_vec(&hb).unwrap(),
            Duration::from_secs(30),
        )
        .await
        .unwrap();

    let markets_a: Vec<String> = (0..500).map(|i| format!("a-market-{i}")).collect();
    let markets_b: Vec<String> = (0..500).map(|i| format!("b-market-{i}")).collect();
    let mut map = HashMap::new();
    map.insert("a".to_string(), markets_a.clone());
    map.insert("b".to_string(), markets_b.clone());
    let generation_before = sharder.publish_assignments(&map).await.unwrap();

    supervisor.tick().await.unwrap();

    let current = sharder.load_current().await.unwrap().unwrap();
    assert!(!current.contains_key("a"));
    let survivor = &current["b"];
    assert_eq!(survivor.len(), 1000);
    let unique: std::collections::HashSet<_> = survivor.iter().collect();
    assert_eq!(unique.len(), 1000, "every market exactly once");
    assert!(
        read_generation(&store).await as u64 > generation_before,
        "redistribution advanced the generation"
    );
}

#[tokio::test]
async fn free_tier_burst_queues_and_completes_without_rejections() {
    // Free-tier shape on a compressed clock: burst 10, then 50/second.
    let limits = TierLimits {
        markets: ClassLimit {
            rate: 50,
            per: Duration::from_secs(1),
            burst: 10,
        },
        orders: ClassLimit {
            rate: 100,
            per: Duration::from_secs(1),
            burst: 20,
        },
        resolutions: ClassLimit {
            rate: 10,
            per: Duration::from_secs(1),
            burst: 5,
        },
    };
    let monitor = Arc::new(UsageMonitor::new(Duration::from_secs(10)));
    let limiter = TieredRateLimiter::spawn(limits, monitor.clone());

    let started = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..60 {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move {
            limiter
                .execute("/markets", 1, || async { Ok::<_, RequestError>(()) })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().expect("no request is rejected");
    }
    let elapsed = started.elapsed();

    // 10 burst immediately; the other 50 need ~1s of refill.
    assert!(elapsed >= Duration::from_millis(800), "elapsed={elapsed:?}");
    assert_eq!(monitor.usage("/markets"), 60);
}

struct CountingTransport {
    calls: AtomicU32,
}

#[async_trait::async_trait]
impl BatchTransport for CountingTransport {
    async fn send(&self, _endpoint: &str, payload: BatchPayload) -> Result<Value, RequestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let body: Value = serde_json::from_slice(&payload.body).unwrap();
        Ok(body["requests"].clone())
    }
}

#[tokio::test]
async fn hundred_requests_coalesce_and_the_next_opens_a_new_batch() {
    let mut config = Config::from_env().unwrap();
    config.batch_max_size = 100;
    config.batch_max_wait = Duration::from_millis(100);
    let monitor = Arc::new(UsageMonitor::new(Duration::from_secs(10)));
    let limiter = TieredRateLimiter::spawn(
        versekeeper::config::Tier::Premium.limits(),
        monitor,
    );
    let transport = Arc::new(CountingTransport {
        calls: AtomicU32::new(0),
    });
    let batcher = RequestBatcher::new(&config, limiter, transport.clone());

    let mut handles = Vec::new();
    for i in 0..101 {
        let batcher = batcher.clone();
        handles.push(tokio::spawn(async move {
            batcher
                .batch_request("/markets", json!({"id": i, "kind": "quote"}), 1)
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // The size cap flushed the first hundred as one call; the 101st opened a
    // fresh group and went out on its own timer.
    assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn significant_change_propagates_and_small_change_does_not() {
    let store = Arc::new(InMemoryStore::new());
    let config = Config::from_env().unwrap();
    let monitor = Arc::new(UsageMonitor::new(Duration::from_secs(10)));
    let limiter = TieredRateLimiter::spawn(versekeeper::config::Tier::Premium.limits(), monitor);
    let rest =
        ProviderRestClient::new("http://localhost:1", Duration::from_secs(1), limiter).unwrap();
    let chain = Arc::new(RecordingChainSink::new());
    let engine = IngestionEngine::new(
        config,
        rest,
        chain.clone(),
        store as Arc<dyn CoordStore>,
        "k1",
        Arc::new(ProgressCounters::new()),
    );

    engine
        .process_markets(vec![versekeeper::models::Market {
            id: "M".into(),
            question: "Will bitcoin be above 100000 usd".into(),
            outcomes: vec!["Yes".into(), "No".into()],
            yes_price: 0.50,
            volume: 10.0,
            liquidity: 10.0,
            resolved: false,
            resolution: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }])
        .await;
    let baseline = chain.update_count();
    let t0 = now_ms();

    // Second observation at +4%: must trigger exactly one more update.
    engine
        .handle_price_update(PriceUpdate {
            market_id: "M".into(),
            yes_price: 0.52,
            observed_at_ms: t0 + 1,
        })
        .await;
    assert_eq!(chain.update_count(), baseline + 1);

    // +0.2% move: below the 1% threshold, no update.
    engine
        .handle_price_update(PriceUpdate {
            market_id: "M".into(),
            yes_price: 0.521,
            observed_at_ms: t0 + 2,
        })
        .await;
    assert_eq!(chain.update_count(), baseline + 1);
}

#[tokio::test]
async fn dedup_window_end_to_end() {
    let dedup: RequestDeduplicator<u32> = RequestDeduplicator::new(Duration::from_millis(200));
    let invocations = Arc::new(AtomicU32::new(0));

    // Two concurrent calls share one invocation.
    let d = Arc::new(dedup);
    let first = {
        let d = d.clone();
        let n = invocations.clone();
        tokio::spawn(async move {
            d.deduplicate("markets:hot", || async move {
                n.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok::<_, RequestError>(1)
            })
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = {
        let d = d.clone();
        let n = invocations.clone();
        tokio::spawn(async move {
            d.deduplicate("markets:hot", || async move {
                n.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RequestError>(2)
            })
            .await
        })
    };
    assert_eq!(first.await.unwrap().unwrap(), 1);
    assert_eq!(second.await.unwrap().unwrap(), 1);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    // Within the TTL: served from cache.
    let third = d
        .deduplicate("markets:hot", || async {
            invocations.fetch_add(1, Ordering::SeqCst);
            Ok::<_, RequestError>(3)
        })
        .await
        .unwrap();
    assert_eq!(third, 1);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    // Past the TTL: the function runs again.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let fourth = d
        .deduplicate("markets:hot", || async {
            invocations.fetch_add(1, Ordering::SeqCst);
            Ok::<_, RequestError>(4)
        })
        .await
        .unwrap();
    assert_eq!(fourth, 4);
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
}
