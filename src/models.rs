//! Core domain types shared across the keeper fleet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 128-bit verse identifier.
///
/// Canonically a `u128` (first 16 bytes of the question digest, big-endian).
/// Serialized as 32 lowercase hex chars; the two representations agree
/// bitwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VerseId(pub u128);

impl VerseId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_be_bytes(bytes))
    }

    pub fn to_hex(self) -> String {
        format!("{:032x}", self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        u128::from_str_radix(s, 16).ok().map(Self)
    }
}

impl std::fmt::Display for VerseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl Serialize for VerseId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for VerseId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        VerseId::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid verse id hex"))
    }
}

/// A market as seen from the provider. The coordinator holds a read-through
/// cache of these; the provider owns them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    pub question: String,
    pub outcomes: Vec<String>,
    pub yes_price: f64,
    pub volume: f64,
    pub liquidity: f64,
    pub resolved: bool,
    pub resolution: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An equivalence class of markets sharing a classifier-derived id; the unit
/// at which aggregate probabilities go on-chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verse {
    pub id: VerseId,
    pub members: Vec<String>,
    pub probability: f64,
    pub updated_at_ms: i64,
    pub logical_clock: u64,
    /// Strictly increases on each successful on-chain update.
    pub version: u64,
}

/// Price event from the push stream.
#[derive(Debug, Clone)]
pub struct PriceUpdate {
    pub market_id: String,
    pub yes_price: f64,
    pub observed_at_ms: i64,
}

/// Resolution marker from the push stream.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub market_id: String,
    pub label: String,
}

/// Registry entry for a keeper process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeeperInfo {
    pub id: String,
    pub started_at_ms: i64,
    pub capabilities: Vec<String>,
    pub host: String,
    pub last_heartbeat_ms: i64,
    #[serde(default)]
    pub assignment: Vec<String>,
}

/// Snapshot of host resources, attached to every heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f32,
    pub mem_used_mb: u64,
}

/// Written under `keeper:<id>:heartbeat` with a TTL; absence past the TTL
/// means the keeper is failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub ts_ms: i64,
    pub processed: u64,
    pub errors: u64,
    pub queue_depth: u64,
    /// Rolling latency of on-chain publishes, milliseconds.
    #[serde(default)]
    pub latency_ms: f64,
    pub resources: ResourceSnapshot,
}

/// Work assignment published on a keeper's work channel. Consumers accept
/// only if `generation` exceeds the last accepted generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkMessage {
    pub markets: Vec<String>,
    pub ts: i64,
    pub generation: u64,
}

/// Control message published on a keeper's control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "command")]
pub enum ControlMessage {
    BecomeLeader,
    Shutdown,
}

/// Fleet-wide event published on `keeper:events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum KeeperEvent {
    KeeperRemoved { keeper_id: String },
    KeeperRecovered { keeper_id: String },
    CriticalFailure { keeper_id: String },
}

/// Record pushed to the shared retry queue when work on a market fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRecord {
    pub market_id: String,
    pub keeper_id: String,
    pub error: String,
    pub ts: i64,
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verse_id_hex_round_trip() {
        let id = VerseId(0xdead_beef_0123_4567_89ab_cdef_fedc_ba98);
        let hex = id.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(VerseId::from_hex(&hex), Some(id));
    }

    #[test]
    fn verse_id_serde_agrees_with_hex() {
        let id = VerseId::from_bytes([
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
            0x0f, 0x10,
        ]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: VerseId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn work_message_round_trip() {
        let msg = WorkMessage {
            markets: vec!["m1".into(), "m2".into()],
            ts: 1_700_000_000_000,
            generation: 7,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: WorkMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.markets, msg.markets);
        assert_eq!(back.generation, 7);
    }

    #[test]
    fn control_message_wire_format() {
        let json = serde_json::to_string(&ControlMessage::BecomeLeader).unwrap();
        assert_eq!(json, r#"{"command":"become_leader"}"#);
    }
}
