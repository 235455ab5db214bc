//! Ingestion engine.
//!
//! Drives the three market clocks (full sync, hot refresh, resolution
//! monitor) plus the push handler, maintains the verse table, and issues
//! aggregate updates through the keeper's chain authority. Every tick
//! catches and logs its own failures; a bad tick never kills the loop.

use super::cache::{Observation, PriceCache};
use crate::chain::ChainSink;
use crate::config::Config;
use crate::coordination::{keys, CoordStore};
use crate::keeper::ProgressCounters;
use crate::models::{now_ms, Market, PriceUpdate, Resolution, RetryRecord, Verse, VerseId};
use crate::provider::{ProviderPushFeed, ProviderRestClient};
use crate::verse;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Relative price move that forces an immediate verse update.
const SIGNIFICANT_CHANGE: f64 = 0.01;
const HOT_REFRESH_LIMIT: usize = 100;

pub struct IngestionEngine {
    config: Config,
    rest: ProviderRestClient,
    chain: Arc<dyn ChainSink>,
    store: Arc<dyn CoordStore>,
    keeper_id: String,
    counters: Arc<ProgressCounters>,

    pub cache: PriceCache,
    markets: Mutex<HashMap<String, Market>>,
    market_verse: Mutex<HashMap<String, VerseId>>,
    verses: Mutex<HashMap<VerseId, Verse>>,
    processed_resolutions: Mutex<HashSet<String>>,
    pending_resolutions: Mutex<VecDeque<(String, String)>>,
    /// When set, only assigned markets are processed.
    assignment: RwLock<Option<HashSet<String>>>,
}

impl IngestionEngine {
    pub fn new(
        config: Config,
        rest: ProviderRestClient,
        chain: Arc<dyn ChainSink>,
        store: Arc<dyn CoordStore>,
        keeper_id: &str,
        counters: Arc<ProgressCounters>,
    ) -> Arc<Self> {
        let cache = PriceCache::new(config.price_cache_capacity, config.hot_window * 720);
        Arc::new(Self {
            config,
            rest,
            chain,
            store,
            keeper_id: keeper_id.to_string(),
            counters,
            cache,
            markets: Mutex::new(HashMap::new()),
            market_verse: Mutex::new(HashMap::new()),
            verses: Mutex::new(HashMap::new()),
            processed_resolutions: Mutex::new(HashSet::new()),
            pending_resolutions: Mutex::new(VecDeque::new()),
            assignment: RwLock::new(None),
        })
    }

    /// Restrict processing to the keeper's current shard.
    pub fn set_assignment(&self, markets: Vec<String>) {
        *self.assignment.write() = Some(markets.into_iter().collect());
    }

    pub fn verse_of(&self, market_id: &str) -> Option<VerseId> {
        self.market_verse.lock().get(market_id).copied()
    }

    pub fn market_universe(&self) -> Vec<String> {
        self.markets.lock().keys().cloned().collect()
    }

    pub fn verse(&self, id: VerseId) -> Option<Verse> {
        self.verses.lock().get(&id).cloned()
    }

    /// Spawn the three clocks and the push handler. The caller owns the
    /// handles and aborts them on shutdown.
    pub fn spawn_clocks(self: &Arc<Self>, feed: &ProviderPushFeed) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let engine = self.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = interval(engine.config.full_sync_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if let Err(e) = engine.full_sync().await {
                    warn!(error = %e, "full sync tick failed");
                }
            }
        }));

        let engine = self.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = interval(engine.config.hot_refresh_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                engine.hot_refresh().await;
            }
        }));

        let engine = self.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = interval(engine.config.resolution_monitor_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                engine.resolution_tick().await;
            }
        }));

        let engine = self.clone();
        let mut prices = feed.subscribe_prices();
        handles.push(tokio::spawn(async move {
            loop {
                match prices.recv().await {
                    Ok(update) => engine.handle_price_update(update).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "price stream lagged; continuing");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        error!("price stream closed");
                        return;
                    }
                }
            }
        }));

        let engine = self.clone();
        let mut resolutions = feed.subscribe_resolutions();
        handles.push(tokio::spawn(async move {
            loop {
                match resolutions.recv().await {
                    Ok(resolution) => engine.handle_resolution(resolution),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "resolution stream lagged; continuing");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        }));

        handles
    }

    /// Paginated pull of the whole universe; aggregates per verse and pushes
    /// updates on-chain. Pages are spaced out to smooth the bucket.
    pub async fn full_sync(self: &Arc<Self>) -> anyhow::Result<()> {
        let page_size = self.config.sync_page_size;
        let mut offset = 0usize;
        loop {
            let page = self
                .rest
                .fetch_markets(page_size, offset)
                .await
                .map_err(|e| anyhow::anyhow!("fetch markets page at {offset}: {e}"))?;
            let fetched = page.len();
            self.process_markets(page).await;
            if fetched < page_size {
                break;
            }
            offset += fetched;
            sleep(self.config.sync_page_pause).await;
        }
        debug!(markets = self.markets.lock().len(), "full sync complete");
        Ok(())
    }

    fn in_assignment(&self, market_id: &str) -> bool {
        match self.assignment.read().as_ref() {
            Some(assigned) => assigned.contains(market_id),
            None => true,
        }
    }

    /// Classify a batch, refresh the verse table, and update every touched
    /// verse.
    pub async fn process_markets(self: &Arc<Self>, batch: Vec<Market>) {
        let mut touched: HashSet<VerseId> = HashSet::new();
        for market in batch {
            let verse_id = verse::classify(&market.question);
            if market.resolved {
                self.handle_resolution(Resolution {
                    market_id: market.id.clone(),
                    label: market.resolution.clone().unwrap_or_else(|| "unknown".into()),
                });
            }
            self.cache
                .observe(&market.id, market.yes_price, market.updated_at.timestamp_millis());
            self.market_verse.lock().insert(market.id.clone(), verse_id);
            {
                let mut verses = self.verses.lock();
                let entry = verses.entry(verse_id).or_insert_with(|| Verse {
                    id: verse_id,
                    members: Vec::new(),
                    probability: 0.5,
                    updated_at_ms: 0,
                    logical_clock: 0,
                    version: 0,
                });
                if !entry.members.contains(&market.id) {
                    entry.members.push(market.id.clone());
                }
            }
            let process = self.in_assignment(&market.id);
            self.markets.lock().insert(market.id.clone(), market);
            if process {
                touched.insert(verse_id);
            }
        }

        for verse_id in touched {
            self.update_verse(verse_id, None).await;
        }
    }

    /// Recompute one verse's aggregate and publish it. `trigger` names the
    /// market that prompted the update, for retry bookkeeping.
    pub async fn update_verse(self: &Arc<Self>, verse_id: VerseId, trigger: Option<&str>) {
        let (probability, pending_version, retry_market) = {
            let members = match self.verses.lock().get(&verse_id) {
                Some(verse) => verse.members.clone(),
                None => return,
            };
            let markets = self.markets.lock();
            let member_markets: Vec<&Market> =
                members.iter().filter_map(|id| markets.get(id)).collect();
            let probability = verse::aggregate_probability(member_markets.iter().copied());

            let mut verses = self.verses.lock();
            let Some(entry) = verses.get_mut(&verse_id) else { return };
            entry.probability = probability;
            entry.updated_at_ms = now_ms();
            entry.logical_clock += 1;
            let retry_market = trigger
                .map(str::to_string)
                .or_else(|| entry.members.first().cloned());
            (probability, entry.version + 1, retry_market)
        };

        let started = std::time::Instant::now();
        let outcome = self
            .chain
            .update_verse_prob(verse_id, probability, pending_version)
            .await;
        self.counters
            .record_latency(started.elapsed().as_millis() as u64);
        match outcome {
            Ok(()) => {
                if let Some(entry) = self.verses.lock().get_mut(&verse_id) {
                    entry.version = pending_version;
                }
                self.counters.record_processed(1);
            }
            Err(e) => {
                warn!(verse = %verse_id, error = %e, "aggregate update rejected");
                self.counters.record_error();
                let _ = self
                    .store
                    .increment_by(keys::ERRORS, &self.keeper_id, 1)
                    .await;
                if let Some(market_id) = retry_market {
                    let record = RetryRecord {
                        market_id,
                        keeper_id: self.keeper_id.clone(),
                        error: e.to_string(),
                        ts: now_ms(),
                    };
                    if let Ok(bytes) = serde_json::to_vec(&record) {
                        let _ = self.store.list_push(keys::RETRY_QUEUE, &bytes).await;
                    }
                }
            }
        }
    }

    /// Re-publish aggregates for the verses of the hottest cached markets,
    /// a bounded number in flight at once.
    pub async fn hot_refresh(self: &Arc<Self>) {
        let hot = self
            .cache
            .hot_markets(self.config.hot_window, HOT_REFRESH_LIMIT);
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for market_id in hot {
            if !self.in_assignment(&market_id) {
                continue;
            }
            if let Some(verse_id) = self.verse_of(&market_id) {
                if seen.insert(verse_id) {
                    targets.push((verse_id, market_id));
                }
            }
        }

        let tasks: Vec<_> = targets
            .into_iter()
            .map(|(verse_id, market_id)| {
                let engine = self.clone();
                async move {
                    engine.update_verse(verse_id, Some(&market_id)).await;
                    Ok::<_, std::convert::Infallible>(())
                }
            })
            .collect();
        crate::optimizer::run_bounded(tasks, self.config.parallel_requests).await;
    }

    /// Scan for newly resolved markets, then drain the resolution queue
    /// through the chain.
    pub async fn resolution_tick(self: &Arc<Self>) {
        {
            let markets = self.markets.lock();
            let processed = self.processed_resolutions.lock();
            let mut pending = self.pending_resolutions.lock();
            for (id, market) in markets.iter() {
                if market.resolved
                    && !processed.contains(id)
                    && self.in_assignment(id)
                    && !pending.iter().any(|(queued, _)| queued == id)
                {
                    let label = market.resolution.clone().unwrap_or_else(|| "unknown".into());
                    pending.push_back((id.clone(), label));
                }
            }
            self.counters.set_queue_depth(pending.len() as u64);
        }

        loop {
            let Some((market_id, label)) = self.pending_resolutions.lock().pop_front() else {
                break;
            };
            match self.chain.mark_resolved(&market_id, &label).await {
                Ok(()) => {
                    self.processed_resolutions.lock().insert(market_id);
                    self.counters.record_processed(1);
                }
                Err(e) => {
                    warn!(market_id, error = %e, "resolution publish failed; will retry");
                    self.counters.record_error();
                    // Back on the queue for the next tick.
                    self.pending_resolutions.lock().push_back((market_id, label));
                    break;
                }
            }
        }
        self.counters
            .set_queue_depth(self.pending_resolutions.lock().len() as u64);

        // A verse lives until every member has resolved.
        {
            let markets = self.markets.lock();
            let mut verses = self.verses.lock();
            verses.retain(|_, verse| {
                verse
                    .members
                    .iter()
                    .any(|m| markets.get(m).map_or(false, |market| !market.resolved))
            });
        }
    }

    /// Push-stream price event: refresh the cache and trigger an immediate
    /// verse update when the move is significant. First observations only
    /// seed the baseline.
    pub async fn handle_price_update(self: &Arc<Self>, update: PriceUpdate) {
        let observation =
            self.cache
                .observe(&update.market_id, update.yes_price, update.observed_at_ms);

        match observation {
            Observation::Seeded | Observation::Stale => {}
            Observation::Updated { previous } => {
                if let Some(market) = self.markets.lock().get_mut(&update.market_id) {
                    market.yes_price = update.yes_price;
                }
                if !self.in_assignment(&update.market_id) {
                    return;
                }
                let moved = if previous.abs() > f64::EPSILON {
                    ((update.yes_price - previous) / previous).abs()
                } else {
                    // From zero, any move is significant.
                    f64::INFINITY
                };
                if moved > SIGNIFICANT_CHANGE {
                    if let Some(verse_id) = self.verse_of(&update.market_id) {
                        info!(
                            market = %update.market_id,
                            previous,
                            price = update.yes_price,
                            "significant move; updating verse"
                        );
                        self.update_verse(verse_id, Some(&update.market_id)).await;
                    }
                }
            }
        }
    }

    pub fn handle_resolution(&self, resolution: Resolution) {
        let mut markets = self.markets.lock();
        if let Some(market) = markets.get_mut(&resolution.market_id) {
            market.resolved = true;
            market.resolution = Some(resolution.label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::RecordingChainSink;
    use crate::config::Tier;
    use crate::coordination::InMemoryStore;
    use crate::ratelimit::{TieredRateLimiter, UsageMonitor};
    use chrono::Utc;
    use std::time::Duration;

    fn market(id: &str, question: &str, yes_price: f64, volume: f64, liquidity: f64) -> Market {
        Market {
            id: id.into(),
            question: question.into(),
            outcomes: vec!["Yes".into(), "No".into()],
            yes_price,
            volume,
            liquidity,
            resolved: false,
            resolution: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn engine_with(chain: Arc<RecordingChainSink>) -> Arc<IngestionEngine> {
        let config = Config::from_env().unwrap();
        let monitor = Arc::new(UsageMonitor::new(Duration::from_secs(10)));
        let limiter = TieredRateLimiter::spawn(Tier::Premium.limits(), monitor);
        let rest =
            ProviderRestClient::new("http://localhost:1", Duration::from_secs(1), limiter).unwrap();
        IngestionEngine::new(
            config,
            rest,
            chain,
            Arc::new(InMemoryStore::new()),
            "keeper-test",
            Arc::new(ProgressCounters::new()),
        )
    }

    #[tokio::test]
    async fn batch_processing_updates_verse_aggregate() {
        let chain = Arc::new(RecordingChainSink::new());
        let engine = engine_with(chain.clone());

        engine
            .process_markets(vec![
                market("m1", "Will bitcoin be above 100000 usd", 0.2, 10.0, 10.0),
                market("m2", "btc above 100000 usd", 0.8, 30.0, 10.0),
            ])
            .await;

        let updates = chain.verse_updates.lock();
        assert_eq!(updates.len(), 1);
        let (verse_id, probability, version) = updates[0];
        assert_eq!(verse_id, verse::classify("btc above 100000 usd"));
        assert!((probability - 0.65).abs() < 1e-9);
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn version_strictly_increases_across_updates() {
        let chain = Arc::new(RecordingChainSink::new());
        let engine = engine_with(chain.clone());
        let batch = vec![market("m1", "btc above 100000 usd", 0.4, 1.0, 1.0)];
        engine.process_markets(batch.clone()).await;
        engine.process_markets(batch).await;

        let updates = chain.verse_updates.lock();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].2, 1);
        assert_eq!(updates[1].2, 2);
    }

    #[tokio::test]
    async fn rejected_update_lands_on_retry_queue() {
        let chain = Arc::new(RecordingChainSink::new());
        let engine = engine_with(chain.clone());
        engine
            .process_markets(vec![market("m1", "btc above 100000 usd", 0.4, 1.0, 1.0)])
            .await;

        *chain.reject_updates.lock() = true;
        let verse_id = engine.verse_of("m1").unwrap();
        engine.update_verse(verse_id, Some("m1")).await;

        let record = engine
            .store
            .list_pop(keys::RETRY_QUEUE)
            .await
            .unwrap()
            .expect("retry record pushed");
        let record: RetryRecord = serde_json::from_slice(&record).unwrap();
        assert_eq!(record.market_id, "m1");
        assert_eq!(record.keeper_id, "keeper-test");
        // Version must not advance on failure.
        assert_eq!(engine.verse(verse_id).unwrap().version, 1);
    }

    #[tokio::test]
    async fn first_push_observation_seeds_without_update() {
        let chain = Arc::new(RecordingChainSink::new());
        let engine = engine_with(chain.clone());
        engine
            .process_markets(vec![market("m1", "btc above 100000 usd", 0.5, 1.0, 1.0)])
            .await;
        let baseline = chain.update_count();

        // The market is known but this is a fresh cache entry elsewhere.
        engine
            .handle_price_update(PriceUpdate {
                market_id: "m-unseen".into(),
                yes_price: 0.50,
                observed_at_ms: now_ms(),
            })
            .await;
        assert_eq!(chain.update_count(), baseline);
    }

    #[tokio::test]
    async fn significant_move_triggers_update_small_move_does_not() {
        let chain = Arc::new(RecordingChainSink::new());
        let engine = engine_with(chain.clone());
        engine
            .process_markets(vec![market("m1", "btc above 100000 usd", 0.50, 1.0, 1.0)])
            .await;
        let baseline = chain.update_count();
        let t0 = now_ms();

        // 0.50 -> 0.502 is 0.4%, under the 1% bar.
        engine
            .handle_price_update(PriceUpdate {
                market_id: "m1".into(),
                yes_price: 0.502,
                observed_at_ms: t0 + 1,
            })
            .await;
        assert_eq!(chain.update_count(), baseline);

        // 0.502 -> 0.52 is ~3.6%.
        engine
            .handle_price_update(PriceUpdate {
                market_id: "m1".into(),
                yes_price: 0.52,
                observed_at_ms: t0 + 2,
            })
            .await;
        assert_eq!(chain.update_count(), baseline + 1);
    }

    #[tokio::test]
    async fn stale_push_updates_are_dropped() {
        let chain = Arc::new(RecordingChainSink::new());
        let engine = engine_with(chain.clone());
        engine
            .process_markets(vec![market("m1", "btc above 100000 usd", 0.50, 1.0, 1.0)])
            .await;
        let baseline = chain.update_count();
        let t0 = now_ms();

        engine
            .handle_price_update(PriceUpdate {
                market_id: "m1".into(),
                yes_price: 0.9,
                observed_at_ms: t0 - 10_000,
            })
            .await;
        assert_eq!(chain.update_count(), baseline);
        assert!((engine.cache.get("m1").unwrap().last_yes_price - 0.50).abs() < 1e-9);
    }

    #[tokio::test]
    async fn resolution_tick_processes_each_market_once() {
        let chain = Arc::new(RecordingChainSink::new());
        let engine = engine_with(chain.clone());
        let mut resolved = market("m1", "btc above 100000 usd", 1.0, 1.0, 1.0);
        resolved.resolved = true;
        resolved.resolution = Some("Yes".into());
        engine.process_markets(vec![resolved]).await;

        engine.resolution_tick().await;
        engine.resolution_tick().await;

        let resolutions = chain.resolutions.lock();
        assert_eq!(resolutions.len(), 1);
        assert_eq!(resolutions[0], ("m1".to_string(), "Yes".to_string()));
    }

    #[tokio::test]
    async fn assignment_filters_processing() {
        let chain = Arc::new(RecordingChainSink::new());
        let engine = engine_with(chain.clone());
        engine.set_assignment(vec!["owned".into()]);

        engine
            .process_markets(vec![
                market("owned", "btc above 100000 usd", 0.5, 1.0, 1.0),
                market("foreign", "ethereum above 5000 usd", 0.5, 1.0, 1.0),
            ])
            .await;

        let updates = chain.verse_updates.lock();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, verse::classify("btc above 100000 usd"));
    }
}
