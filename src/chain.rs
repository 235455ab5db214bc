//! On-chain update sink.
//!
//! The coordinator treats the chain as an opaque signed RPC surface with
//! idempotent semantics per `(verse_id, version)`. Requests are signed with
//! the keeper's HMAC authority, the same scheme our order-flow services use.

use crate::models::VerseId;
use crate::ratelimit::RequestError;
use anyhow::{Context, Result};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::json;
use sha2::Sha256;
use std::time::Duration;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

#[async_trait::async_trait]
pub trait ChainSink: Send + Sync {
    /// Publish a verse aggregate. `version` makes the call idempotent
    /// on-chain; a replayed `(verse_id, version)` is a no-op there.
    async fn update_verse_prob(
        &self,
        verse_id: VerseId,
        probability: f64,
        version: u64,
    ) -> Result<(), RequestError>;

    /// Mark a market resolved with its winning label.
    async fn mark_resolved(&self, market_id: &str, label: &str) -> Result<(), RequestError>;
}

/// Signed JSON-RPC implementation.
pub struct RpcChainSink {
    client: Client,
    rpc_url: String,
    keeper_id: String,
    signing_key: Option<Vec<u8>>,
}

impl RpcChainSink {
    pub fn new(rpc_url: &str, keeper_id: &str, signing_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build chain RPC client")?;
        Ok(Self {
            client,
            rpc_url: rpc_url.to_string(),
            keeper_id: keeper_id.to_string(),
            signing_key: signing_key.map(|k| k.into_bytes()),
        })
    }

    fn signature(&self, body: &[u8]) -> Option<String> {
        let key = self.signing_key.as_ref()?;
        let mut mac = HmacSha256::new_from_slice(key).ok()?;
        mac.update(body);
        Some(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    async fn call(&self, method: &str, params: serde_json::Value) -> Result<(), RequestError> {
        let body = serde_json::to_vec(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        }))
        .map_err(|e| RequestError::Persistent(e.to_string()))?;

        let mut request = self
            .client
            .post(&self.rpc_url)
            .header("content-type", "application/json")
            .header("x-keeper-id", &self.keeper_id);
        if let Some(signature) = self.signature(&body) {
            request = request.header("x-keeper-signature", signature);
        }

        let response = request.body(body).send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                RequestError::Transient(e.to_string())
            } else {
                RequestError::Persistent(e.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(RequestError::RateLimited);
        }
        if status.is_server_error() {
            return Err(RequestError::Transient(format!("chain rpc returned {status}")));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RequestError::Persistent(format!(
                "chain rpc returned {status}: {text}"
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChainSink for RpcChainSink {
    async fn update_verse_prob(
        &self,
        verse_id: VerseId,
        probability: f64,
        version: u64,
    ) -> Result<(), RequestError> {
        debug!(verse = %verse_id, probability, version, "updateVerseProb");
        self.call(
            "updateVerseProb",
            json!({
                "verse_id": verse_id.to_hex(),
                "probability": probability,
                "version": version,
            }),
        )
        .await
    }

    async fn mark_resolved(&self, market_id: &str, label: &str) -> Result<(), RequestError> {
        debug!(market_id, label, "markResolved");
        self.call(
            "markResolved",
            json!({ "market_id": market_id, "resolution": label }),
        )
        .await
    }
}

/// Records every call; used by tests and dry runs.
#[derive(Default)]
pub struct RecordingChainSink {
    pub verse_updates: Mutex<Vec<(VerseId, f64, u64)>>,
    pub resolutions: Mutex<Vec<(String, String)>>,
    /// When set, verse updates fail with a persistent error.
    pub reject_updates: Mutex<bool>,
}

impl RecordingChainSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_count(&self) -> usize {
        self.verse_updates.lock().len()
    }
}

#[async_trait::async_trait]
impl ChainSink for RecordingChainSink {
    async fn update_verse_prob(
        &self,
        verse_id: VerseId,
        probability: f64,
        version: u64,
    ) -> Result<(), RequestError> {
        if *self.reject_updates.lock() {
            return Err(RequestError::Persistent("update rejected".into()));
        }
        self.verse_updates.lock().push((verse_id, probability, version));
        Ok(())
    }

    async fn mark_resolved(&self, market_id: &str, label: &str) -> Result<(), RequestError> {
        self.resolutions
            .lock()
            .push((market_id.to_string(), label.to_string()));
        Ok(())
    }
}
