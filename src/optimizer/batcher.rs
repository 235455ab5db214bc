//! Request batching.
//!
//! Requests against the same endpoint with the same "common params" (params
//! minus `id` and `timestamp`) coalesce into one outbound call. A group
//! flushes when its timer fires, its size cap is hit, or it is flushed
//! explicitly.

use crate::config::Config;
use crate::ratelimit::{RequestError, TieredRateLimiter};
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Outbound batch body, possibly gzip-compressed.
#[derive(Debug, Clone)]
pub struct BatchPayload {
    pub body: Vec<u8>,
    pub compressed: bool,
}

/// Downstream sink for flushed batches. The provider client implements this;
/// tests substitute their own.
#[async_trait::async_trait]
pub trait BatchTransport: Send + Sync {
    async fn send(&self, endpoint: &str, payload: BatchPayload) -> Result<Value, RequestError>;
}

struct PendingRequest {
    params: Value,
    priority: u8,
    tx: oneshot::Sender<Result<Value, String>>,
}

struct Group {
    id: u64,
    endpoint: String,
    requests: Vec<PendingRequest>,
}

pub struct RequestBatcher {
    max_size: usize,
    max_wait: Duration,
    compression_threshold: usize,
    limiter: Arc<TieredRateLimiter>,
    transport: Arc<dyn BatchTransport>,
    groups: Mutex<HashMap<String, Group>>,
    next_group_id: Mutex<u64>,
}

impl RequestBatcher {
    pub fn new(
        config: &Config,
        limiter: Arc<TieredRateLimiter>,
        transport: Arc<dyn BatchTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            max_size: config.batch_max_size,
            max_wait: config.batch_max_wait,
            compression_threshold: config.compression_threshold,
            limiter,
            transport,
            groups: Mutex::new(HashMap::new()),
            next_group_id: Mutex::new(0),
        })
    }

    /// Group key: endpoint plus params with `id` and `timestamp` removed.
    /// serde_json maps iterate sorted, so the key is canonical.
    fn batch_key(endpoint: &str, params: &Value) -> String {
        let common = match params {
            Value::Object(map) => {
                let filtered: serde_json::Map<String, Value> = map
                    .iter()
                    .filter(|(k, _)| k.as_str() != "id" && k.as_str() != "timestamp")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Value::Object(filtered)
            }
            other => other.clone(),
        };
        format!("{endpoint}:{common}")
    }

    /// Join the batch for `(endpoint, params)`; resolves with this request's
    /// share of the batched response.
    pub async fn batch_request(
        self: &Arc<Self>,
        endpoint: &str,
        params: Value,
        priority: u8,
    ) -> Result<Value, RequestError> {
        let key = Self::batch_key(endpoint, &params);
        let (tx, rx) = oneshot::channel();

        // A group that reaches the size cap is taken out of the map under the
        // same lock, so a later request can never join a full group.
        let full_group = {
            let mut groups = self.groups.lock();
            let group = groups.entry(key.clone()).or_insert_with(|| {
                let mut next = self.next_group_id.lock();
                *next += 1;
                let id = *next;
                // First member arms the group timer.
                let batcher = self.clone();
                let timer_key = key.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(batcher.max_wait).await;
                    batcher.flush_group(&timer_key, Some(id)).await;
                });
                Group {
                    id,
                    endpoint: endpoint.to_string(),
                    requests: Vec::new(),
                }
            });
            group.requests.push(PendingRequest { params, priority, tx });
            if group.requests.len() >= self.max_size {
                groups.remove(&key)
            } else {
                None
            }
        };

        if let Some(group) = full_group {
            self.flush_taken(group).await;
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(RequestError::Persistent(err)),
            Err(_) => Err(RequestError::Transient("batch dropped".into())),
        }
    }

    /// Flush one group by key. `expected_id` guards timer flushes against a
    /// group that was already flushed and re-created under the same key.
    pub async fn flush_group(self: &Arc<Self>, key: &str, expected_id: Option<u64>) {
        let group = {
            let mut groups = self.groups.lock();
            match groups.get(key) {
                Some(group) if expected_id.map_or(true, |id| group.id == id) => {
                    groups.remove(key)
                }
                _ => None,
            }
        };
        if let Some(group) = group {
            self.flush_taken(group).await;
        }
    }

    async fn flush_taken(self: &Arc<Self>, mut group: Group) {
        if group.requests.is_empty() {
            return;
        }

        // Priority order inside the batch; responses map positionally onto
        // this ordering.
        group.requests.sort_by(|a, b| b.priority.cmp(&a.priority));
        let max_priority = group.requests.iter().map(|r| r.priority).max().unwrap_or(0);

        let payload_json = json!({
            "requests": group.requests.iter().map(|r| r.params.clone()).collect::<Vec<_>>(),
            "count": group.requests.len(),
            "ts": crate::models::now_ms(),
        });
        let payload = self.encode_payload(&payload_json);

        debug!(
            endpoint = %group.endpoint,
            size = group.requests.len(),
            compressed = payload.compressed,
            "flushing batch"
        );

        let endpoint = group.endpoint.clone();
        let transport = self.transport.clone();
        let send_endpoint = endpoint.clone();
        let send_payload = payload.clone();
        let result = self
            .limiter
            .execute(&endpoint, max_priority, move || {
                let transport = transport.clone();
                let endpoint = send_endpoint.clone();
                let payload = send_payload.clone();
                async move { transport.send(&endpoint, payload).await }
            })
            .await;

        match result {
            Ok(Value::Array(items)) => {
                for (i, request) in group.requests.into_iter().enumerate() {
                    let slice = items.get(i).cloned().unwrap_or(Value::Null);
                    let _ = request.tx.send(Ok(slice));
                }
            }
            Ok(scalar) => {
                // Scalar response broadcasts to every waiter.
                for request in group.requests {
                    let _ = request.tx.send(Ok(scalar.clone()));
                }
            }
            Err(err) => {
                warn!(endpoint = %endpoint, error = %err, "batch flush failed");
                let msg = err.to_string();
                for request in group.requests {
                    let _ = request.tx.send(Err(msg.clone()));
                }
            }
        }
    }

    /// Flush every open group (shutdown path).
    pub async fn flush_all(self: &Arc<Self>) {
        let keys: Vec<String> = self.groups.lock().keys().cloned().collect();
        for key in keys {
            self.flush_group(&key, None).await;
        }
    }

    /// Gzip the serialized payload when it is large enough and actually
    /// shrinks; under 90% of the original or it ships uncompressed.
    fn encode_payload(&self, payload: &Value) -> BatchPayload {
        let body = serde_json::to_vec(payload).unwrap_or_default();
        if body.len() < self.compression_threshold {
            return BatchPayload { body, compressed: false };
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        let compressed = if encoder.write_all(&body).is_ok() {
            encoder.finish().unwrap_or_default()
        } else {
            Vec::new()
        };
        if !compressed.is_empty() && (compressed.len() as f64) < body.len() as f64 * 0.9 {
            BatchPayload { body: compressed, compressed: true }
        } else {
            BatchPayload { body, compressed: false }
        }
    }

    pub fn open_groups(&self) -> usize {
        self.groups.lock().len()
    }
}
