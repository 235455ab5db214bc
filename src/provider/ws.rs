//! Provider push stream.
//!
//! One persistent WebSocket connection; subscribes to all market updates on
//! open and fans parsed events out on broadcast channels. Malformed frames
//! are logged and dropped; the stream itself survives them. Reconnects with
//! exponential backoff, attempt count reset on a successful open.

use crate::models::{now_ms, PriceUpdate, Resolution};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const MAX_RECONNECT_EXPONENT: u32 = 6;
const PING_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub enum PushEvent {
    Price(PriceUpdate),
    Resolution(Resolution),
}

pub struct ProviderPushFeed {
    price_tx: broadcast::Sender<PriceUpdate>,
    resolution_tx: broadcast::Sender<Resolution>,
}

impl ProviderPushFeed {
    /// Spawn the stream worker and return a handle consumers subscribe on.
    pub fn spawn(ws_url: String) -> Arc<Self> {
        let (price_tx, _) = broadcast::channel(4096);
        let (resolution_tx, _) = broadcast::channel(1024);
        let feed = Arc::new(Self { price_tx, resolution_tx });

        let worker = feed.clone();
        tokio::spawn(async move {
            worker.run(ws_url).await;
        });

        feed
    }

    pub fn subscribe_prices(&self) -> broadcast::Receiver<PriceUpdate> {
        self.price_tx.subscribe()
    }

    pub fn subscribe_resolutions(&self) -> broadcast::Receiver<Resolution> {
        self.resolution_tx.subscribe()
    }

    async fn run(self: Arc<Self>, ws_url: String) {
        let mut attempt: u32 = 0;
        loop {
            match self.connect_and_stream(&ws_url).await {
                Ok(()) => {
                    attempt = 0;
                }
                Err(e) => {
                    let delay = Duration::from_secs(1u64 << attempt.min(MAX_RECONNECT_EXPONENT));
                    warn!(error = %e, delay_secs = delay.as_secs(), "push stream disconnected; reconnecting");
                    sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn connect_and_stream(&self, ws_url: &str) -> Result<()> {
        info!(url = ws_url, "connecting to provider push stream");
        let (ws_stream, _) = connect_async(ws_url).await.context("push stream connect")?;
        info!("provider push stream connected");

        let (mut write, mut read) = ws_stream.split();

        let subscribe = serde_json::json!({
            "type": "subscribe",
            "channel": "market_updates",
            "params": { "all": true },
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .context("send market_updates subscription")?;

        let mut ping = interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    let _ = write.send(Message::Ping(Vec::new())).await;
                }
                ws_msg = read.next() => {
                    let Some(ws_msg) = ws_msg else {
                        return Err(anyhow::anyhow!("push stream ended"));
                    };
                    match ws_msg {
                        Ok(Message::Text(text)) => {
                            if let Some(event) = parse_event(&text) {
                                self.dispatch(event);
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(?frame, "push stream close frame");
                            return Err(anyhow::anyhow!("push stream closed by provider"));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(anyhow::anyhow!("push stream error: {e}"));
                        }
                    }
                }
            }
        }
    }

    fn dispatch(&self, event: PushEvent) {
        match event {
            PushEvent::Price(update) => {
                let _ = self.price_tx.send(update);
            }
            PushEvent::Resolution(resolution) => {
                let _ = self.resolution_tx.send(resolution);
            }
        }
    }
}

/// Parse one push frame. Unknown types and malformed frames yield `None`.
pub fn parse_event(text: &str) -> Option<PushEvent> {
    let json: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "dropping non-JSON push frame");
            return None;
        }
    };

    let kind = json.get("type").and_then(Value::as_str)?;
    match kind {
        "price_update" => {
            let market_id = json.get("market_id").and_then(Value::as_str)?.to_string();
            let yes_price = number_field(&json, "yes_price")?;
            Some(PushEvent::Price(PriceUpdate {
                market_id,
                yes_price,
                observed_at_ms: now_ms(),
            }))
        }
        "resolution_update" => {
            let market_id = json.get("market_id").and_then(Value::as_str)?.to_string();
            let label = json.get("resolution").and_then(Value::as_str)?.to_string();
            Some(PushEvent::Resolution(Resolution { market_id, label }))
        }
        // Dispute updates and anything unrecognized are ignored.
        _ => None,
    }
}

/// Providers send numbers both raw and as strings.
fn number_field(json: &Value, key: &str) -> Option<f64> {
    match json.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_price_update() {
        let event = parse_event(r#"{"type":"price_update","market_id":"m1","yes_price":0.42}"#);
        match event {
            Some(PushEvent::Price(update)) => {
                assert_eq!(update.market_id, "m1");
                assert!((update.yes_price - 0.42).abs() < 1e-9);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parses_string_price() {
        let event = parse_event(r#"{"type":"price_update","market_id":"m1","yes_price":"0.55"}"#);
        assert!(matches!(event, Some(PushEvent::Price(u)) if (u.yes_price - 0.55).abs() < 1e-9));
    }

    #[test]
    fn parses_resolution_update() {
        let event =
            parse_event(r#"{"type":"resolution_update","market_id":"m2","resolution":"Yes"}"#);
        match event {
            Some(PushEvent::Resolution(resolution)) => {
                assert_eq!(resolution.market_id, "m2");
                assert_eq!(resolution.label, "Yes");
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn ignores_dispute_and_unknown_types() {
        assert!(parse_event(r#"{"type":"dispute_update","market_id":"m3","disputed":true}"#).is_none());
        assert!(parse_event(r#"{"type":"mystery","market_id":"m4"}"#).is_none());
    }

    #[test]
    fn malformed_frames_are_dropped() {
        assert!(parse_event("not json at all").is_none());
        assert!(parse_event(r#"{"type":"price_update"}"#).is_none());
        assert!(parse_event(r#"{"type":"price_update","market_id":"m5","yes_price":null}"#).is_none());
    }
}
