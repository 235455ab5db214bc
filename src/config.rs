//! Fleet configuration.
//!
//! Everything is env-backed with defaults, same as the rest of our services;
//! the binary may override a few fields from CLI flags.

use anyhow::{bail, Result};
use std::time::Duration;

/// Endpoint classes the rate limiter distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Markets,
    Orders,
    Resolutions,
}

impl EndpointClass {
    pub const ALL: [EndpointClass; 3] = [
        EndpointClass::Markets,
        EndpointClass::Orders,
        EndpointClass::Resolutions,
    ];

    /// Map an endpoint path to its class. Unknown endpoints fall into the
    /// markets class.
    pub fn for_endpoint(endpoint: &str) -> Self {
        if endpoint.contains("order") {
            EndpointClass::Orders
        } else if endpoint.contains("resolution") {
            EndpointClass::Resolutions
        } else {
            EndpointClass::Markets
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::Markets => "markets",
            EndpointClass::Orders => "orders",
            EndpointClass::Resolutions => "resolutions",
        }
    }
}

/// Bucket parameters for one endpoint class: `rate` tokens per `per` window,
/// with `burst` capacity.
#[derive(Debug, Clone, Copy)]
pub struct ClassLimit {
    pub rate: u32,
    pub per: Duration,
    pub burst: u32,
}

/// Per-class limits for one subscription tier.
#[derive(Debug, Clone, Copy)]
pub struct TierLimits {
    pub markets: ClassLimit,
    pub orders: ClassLimit,
    pub resolutions: ClassLimit,
}

impl TierLimits {
    pub fn get(&self, class: EndpointClass) -> ClassLimit {
        match class {
            EndpointClass::Markets => self.markets,
            EndpointClass::Orders => self.orders,
            EndpointClass::Resolutions => self.resolutions,
        }
    }

    /// Emergency mode: half rate, half burst.
    pub fn halved(&self) -> Self {
        fn half(l: ClassLimit) -> ClassLimit {
            ClassLimit {
                rate: (l.rate / 2).max(1),
                per: l.per,
                burst: (l.burst / 2).max(1),
            }
        }
        Self {
            markets: half(self.markets),
            orders: half(self.orders),
            resolutions: half(self.resolutions),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Free,
    Basic,
    Premium,
}

impl Tier {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "basic" => Ok(Tier::Basic),
            "premium" => Ok(Tier::Premium),
            other => bail!("unknown tier: {other}"),
        }
    }

    pub fn limits(&self) -> TierLimits {
        let per = Duration::from_secs(10);
        match self {
            Tier::Free => TierLimits {
                markets: ClassLimit { rate: 50, per, burst: 10 },
                orders: ClassLimit { rate: 100, per, burst: 20 },
                resolutions: ClassLimit { rate: 10, per, burst: 5 },
            },
            Tier::Basic => TierLimits {
                markets: ClassLimit { rate: 150, per, burst: 30 },
                orders: ClassLimit { rate: 300, per, burst: 60 },
                resolutions: ClassLimit { rate: 30, per, burst: 10 },
            },
            Tier::Premium => TierLimits {
                markets: ClassLimit { rate: 500, per, burst: 100 },
                orders: ClassLimit { rate: 1000, per, burst: 200 },
                resolutions: ClassLimit { rate: 100, per, burst: 25 },
            },
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub tier: Tier,
    pub emergency_mode: bool,

    // Provider endpoints
    pub provider_http_base: String,
    pub provider_ws_url: String,
    pub provider_timeout: Duration,

    // On-chain RPC
    pub chain_rpc_url: String,
    pub chain_signing_key: Option<String>,

    // Keeper identity
    pub host: String,
    pub capabilities: Vec<String>,

    // Fleet timing
    pub heartbeat_interval: Duration,
    pub heartbeat_ttl: Duration,
    pub lease_ttl: Duration,
    pub leader_verify_interval: Duration,
    pub reshard_interval: Duration,
    pub health_check_interval: Duration,
    pub max_consecutive_failures: u32,
    pub recovery_timeout: Duration,
    pub retry_drain_interval: Duration,

    // Ingestion clocks
    pub full_sync_interval: Duration,
    pub hot_refresh_interval: Duration,
    pub resolution_monitor_interval: Duration,
    pub sync_page_size: usize,
    pub sync_page_pause: Duration,
    pub hot_window: Duration,
    pub price_cache_capacity: usize,

    // Optimizer
    pub batch_max_size: usize,
    pub batch_max_wait: Duration,
    pub compression_threshold: usize,
    pub parallel_requests: usize,
    pub cache_ttl: Duration,
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let tier = Tier::parse(&env_str("KEEPER_TIER", "free"))?;
        let emergency_mode = env_str("KEEPER_EMERGENCY_MODE", "off") == "on";

        // Clamped to 1..10; a wider window just hammers the provider.
        let parallel_requests = env_u64("KEEPER_PARALLEL_REQUESTS", 5).clamp(1, 10) as usize;

        Ok(Self {
            tier,
            emergency_mode,

            provider_http_base: env_str("PROVIDER_HTTP_BASE", "https://api.provider.example"),
            provider_ws_url: env_str("PROVIDER_WS_URL", "wss://stream.provider.example/ws"),
            provider_timeout: Duration::from_secs(env_u64("PROVIDER_TIMEOUT_SECS", 10)),

            chain_rpc_url: env_str("CHAIN_RPC_URL", "http://localhost:8899"),
            chain_signing_key: std::env::var("CHAIN_SIGNING_KEY").ok(),

            host: env_str("KEEPER_HOST", "localhost"),
            capabilities: env_str("KEEPER_CAPABILITIES", "sync,resolve")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),

            heartbeat_interval: Duration::from_secs(env_u64("KEEPER_HEARTBEAT_SECS", 5)),
            heartbeat_ttl: Duration::from_secs(env_u64("KEEPER_HEARTBEAT_TTL_SECS", 30)),
            lease_ttl: Duration::from_secs(env_u64("KEEPER_LEASE_TTL_SECS", 30)),
            leader_verify_interval: Duration::from_secs(env_u64("KEEPER_LEADER_VERIFY_SECS", 10)),
            reshard_interval: Duration::from_secs(env_u64("KEEPER_RESHARD_SECS", 30)),
            health_check_interval: Duration::from_secs(env_u64("KEEPER_HEALTH_CHECK_SECS", 10)),
            max_consecutive_failures: env_u64("KEEPER_MAX_CONSECUTIVE_FAILURES", 5) as u32,
            recovery_timeout: Duration::from_secs(env_u64("KEEPER_RECOVERY_TIMEOUT_SECS", 60)),
            retry_drain_interval: Duration::from_secs(env_u64("KEEPER_RETRY_DRAIN_SECS", 5)),

            full_sync_interval: Duration::from_secs(env_u64("INGEST_FULL_SYNC_SECS", 2)),
            hot_refresh_interval: Duration::from_secs(env_u64("INGEST_HOT_REFRESH_SECS", 5)),
            resolution_monitor_interval: Duration::from_secs(env_u64(
                "INGEST_RESOLUTION_MONITOR_SECS",
                2,
            )),
            sync_page_size: env_u64("INGEST_SYNC_PAGE_SIZE", 1000) as usize,
            sync_page_pause: Duration::from_millis(env_u64("INGEST_SYNC_PAGE_PAUSE_MS", 200)),
            hot_window: Duration::from_secs(env_u64("INGEST_HOT_WINDOW_SECS", 5)),
            price_cache_capacity: env_u64("INGEST_PRICE_CACHE_CAPACITY", 10_000) as usize,

            batch_max_size: env_u64("OPTIMIZER_BATCH_MAX_SIZE", 100) as usize,
            batch_max_wait: Duration::from_millis(env_u64("OPTIMIZER_BATCH_MAX_WAIT_MS", 100)),
            compression_threshold: env_u64("OPTIMIZER_COMPRESSION_THRESHOLD", 1024) as usize,
            parallel_requests,
            cache_ttl: Duration::from_secs(env_u64("OPTIMIZER_CACHE_TTL_SECS", 60)),
        })
    }

    /// Effective tier limits, accounting for emergency mode.
    pub fn tier_limits(&self) -> TierLimits {
        let limits = self.tier.limits();
        if self.emergency_mode {
            limits.halved()
        } else {
            limits
        }
    }
}
