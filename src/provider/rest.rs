//! Provider REST client.
//!
//! Paginated market pulls over one pooled connection. Every call goes
//! through the tiered rate limiter; the provider reports prices and volumes
//! as strings, parsed here into floats.

use crate::models::Market;
use crate::ratelimit::{RequestError, TieredRateLimiter};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct WireMarket {
    id: String,
    question: String,
    #[serde(default)]
    outcomes: Vec<String>,
    yes_price: String,
    #[serde(default)]
    #[allow(dead_code)]
    last_price: Option<String>,
    volume: String,
    liquidity: String,
    #[serde(default)]
    resolved: bool,
    #[serde(default)]
    resolution: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl WireMarket {
    fn into_market(self) -> Option<Market> {
        let yes_price = self.yes_price.parse::<f64>().ok()?;
        let volume = self.volume.parse::<f64>().ok()?;
        let liquidity = self.liquidity.parse::<f64>().ok()?;
        Some(Market {
            id: self.id,
            question: self.question,
            outcomes: self.outcomes,
            yes_price,
            volume,
            liquidity,
            resolved: self.resolved,
            resolution: self.resolution,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            updated_at: self.updated_at.unwrap_or_else(Utc::now),
        })
    }
}

#[derive(Clone)]
pub struct ProviderRestClient {
    client: Client,
    base_url: String,
    limiter: Arc<TieredRateLimiter>,
}

impl ProviderRestClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        limiter: Arc<TieredRateLimiter>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent("versekeeper/0.1")
            .build()
            .context("Failed to build provider REST client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            limiter,
        })
    }

    /// One page of active markets. Markets that fail to parse are dropped
    /// with a warning rather than failing the page.
    pub async fn fetch_markets(&self, limit: usize, offset: usize) -> Result<Vec<Market>, RequestError> {
        let url = format!(
            "{}/markets?limit={}&offset={}&active=true",
            self.base_url, limit, offset
        );
        let client = self.client.clone();

        let wire: Vec<WireMarket> = self
            .limiter
            .execute("/markets", 5, move || {
                let client = client.clone();
                let url = url.clone();
                async move { fetch_page(&client, &url).await }
            })
            .await?;

        let total = wire.len();
        let markets: Vec<Market> = wire.into_iter().filter_map(WireMarket::into_market).collect();
        if markets.len() < total {
            warn!(
                dropped = total - markets.len(),
                "dropped unparseable market records"
            );
        }
        Ok(markets)
    }
}

async fn fetch_page(client: &Client, url: &str) -> Result<Vec<WireMarket>, RequestError> {
    let response = client.get(url).send().await.map_err(classify_reqwest)?;

    match response.status() {
        StatusCode::TOO_MANY_REQUESTS => Err(RequestError::RateLimited),
        status if status.is_server_error() => {
            Err(RequestError::Transient(format!("provider returned {status}")))
        }
        status if !status.is_success() => {
            let body = response.text().await.unwrap_or_default();
            Err(RequestError::Persistent(format!(
                "provider returned {status}: {body}"
            )))
        }
        _ => response
            .json::<Vec<WireMarket>>()
            .await
            .map_err(|e| RequestError::Persistent(format!("markets schema mismatch: {e}"))),
    }
}

fn classify_reqwest(err: reqwest::Error) -> RequestError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RequestError::Transient(err.to_string())
    } else {
        RequestError::Persistent(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_market_parses_string_floats() {
        let json = r#"{
            "id": "mkt-1",
            "question": "Will bitcoin be above 100000 usd?",
            "outcomes": ["Yes", "No"],
            "yes_price": "0.63",
            "last_price": "0.61",
            "volume": "12500.5",
            "liquidity": "8000",
            "resolved": false,
            "resolution": null
        }"#;
        let wire: WireMarket = serde_json::from_str(json).unwrap();
        let market = wire.into_market().unwrap();
        assert_eq!(market.id, "mkt-1");
        assert!((market.yes_price - 0.63).abs() < 1e-9);
        assert!((market.volume - 12500.5).abs() < 1e-9);
        assert!(!market.resolved);
    }

    #[test]
    fn unparseable_price_drops_market() {
        let json = r#"{
            "id": "mkt-2",
            "question": "q",
            "yes_price": "not-a-number",
            "volume": "1",
            "liquidity": "1"
        }"#;
        let wire: WireMarket = serde_json::from_str(json).unwrap();
        assert!(wire.into_market().is_none());
    }

    #[test]
    fn resolved_market_carries_label() {
        let json = r#"{
            "id": "mkt-3",
            "question": "q",
            "yes_price": "1.0",
            "volume": "10",
            "liquidity": "10",
            "resolved": true,
            "resolution": "Yes"
        }"#;
        let wire: WireMarket = serde_json::from_str(json).unwrap();
        let market = wire.into_market().unwrap();
        assert!(market.resolved);
        assert_eq!(market.resolution.as_deref(), Some("Yes"));
    }
}
