//! Versekeeper - Keeper Fleet Coordinator
//!
//! One process = one keeper. It ingests the provider's market feed,
//! aggregates markets into verses, takes its shard of the universe from the
//! current leader, and pushes aggregate updates on-chain through the tiered
//! rate limiter.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use versekeeper::chain::RpcChainSink;
use versekeeper::config::{Config, Tier};
use versekeeper::coordination::{CoordStore, InMemoryStore};
use versekeeper::fleet::{FailoverSupervisor, LeaderElector, WorkSharder};
use versekeeper::ingest::IngestionEngine;
use versekeeper::keeper::{KeeperNode, ProgressCounters};
use versekeeper::provider::{ProviderPushFeed, ProviderRestClient};
use versekeeper::ratelimit::{ComplianceChecker, TieredRateLimiter, UsageMonitor};

#[derive(Parser, Debug)]
#[command(name = "versekeeper", about = "Keeper fleet coordinator node")]
struct Args {
    /// Keeper id; generated when omitted.
    #[arg(long, env = "KEEPER_ID")]
    keeper_id: Option<String>,

    /// Rate limit tier: free, basic, premium.
    #[arg(long, env = "KEEPER_TIER")]
    tier: Option<String>,

    /// Host label written into the registry.
    #[arg(long, env = "KEEPER_HOST")]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(tier) = &args.tier {
        config.tier = Tier::parse(tier)?;
    }
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    let keeper_id = args
        .keeper_id
        .unwrap_or_else(|| format!("keeper-{}", uuid::Uuid::new_v4()));

    info!(keeper = %keeper_id, tier = ?config.tier, "starting versekeeper");

    // Coordination substrate. The in-process store backs single-node runs;
    // a shared deployment swaps in a networked implementation of the same
    // trait.
    let store: Arc<dyn CoordStore> = Arc::new(InMemoryStore::new());

    let monitor = Arc::new(UsageMonitor::new(Duration::from_secs(10)));
    let limiter = TieredRateLimiter::spawn(config.tier.limits(), monitor.clone());
    if config.emergency_mode {
        limiter.set_emergency_mode(true);
    }

    let rest = ProviderRestClient::new(
        &config.provider_http_base,
        config.provider_timeout,
        limiter.clone(),
    )?;
    let feed = ProviderPushFeed::spawn(config.provider_ws_url.clone());
    let chain = Arc::new(RpcChainSink::new(
        &config.chain_rpc_url,
        &keeper_id,
        config.chain_signing_key.clone(),
    )?);

    let counters = Arc::new(ProgressCounters::new());
    let engine = IngestionEngine::new(
        config.clone(),
        rest,
        chain,
        store.clone(),
        &keeper_id,
        counters.clone(),
    );
    let ingest_tasks = engine.spawn_clocks(&feed);

    let elector = Arc::new(LeaderElector::new(store.clone(), &keeper_id, config.lease_ttl));
    let sharder = Arc::new(WorkSharder::new(store.clone()));
    let supervisor = FailoverSupervisor::new(
        store.clone(),
        sharder.clone(),
        elector.clone(),
        config.clone(),
    );
    let node = KeeperNode::new(
        &keeper_id,
        config.clone(),
        store,
        elector,
        sharder,
        supervisor,
        engine,
        counters,
    );
    node.start().await?;

    // Compliance watchdog: flag endpoints running over the provider limits.
    let checker = ComplianceChecker::new();
    let compliance_monitor = monitor.clone();
    let compliance = tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(10));
        loop {
            tick.tick().await;
            for violation in checker.check(&compliance_monitor) {
                warn!(
                    endpoint = %violation.endpoint,
                    count = violation.count,
                    limit = violation.limit,
                    "over provider rate limit"
                );
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    compliance.abort();
    for task in ingest_tasks {
        task.abort();
    }
    node.stop().await?;
    info!("keeper stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "versekeeper=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
