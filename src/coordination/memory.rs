//! In-process coordination store.
//!
//! Backs single-node runs and the test suite. TTL correctness does not
//! depend on a sweeper: every read checks the entry's deadline.

use super::{CoordStore, Subscription};
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

struct TtlEntry {
    value: Vec<u8>,
    deadline: Option<Instant>,
}

impl TtlEntry {
    fn fresh(&self) -> bool {
        self.deadline.map_or(true, |d| Instant::now() < d)
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    strings: Mutex<HashMap<String, TtlEntry>>,
    hashes: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
    lists: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    channels: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CoordStore for InMemoryStore {
    async fn hash_set(&self, map: &str, key: &str, val: &[u8]) -> Result<()> {
        self.hashes
            .lock()
            .entry(map.to_string())
            .or_default()
            .insert(key.to_string(), val.to_vec());
        Ok(())
    }

    async fn hash_get(&self, map: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .hashes
            .lock()
            .get(map)
            .and_then(|m| m.get(key))
            .cloned())
    }

    async fn hash_del(&self, map: &str, key: &str) -> Result<()> {
        if let Some(m) = self.hashes.lock().get_mut(map) {
            m.remove(key);
        }
        Ok(())
    }

    async fn hash_get_all(&self, map: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .hashes
            .lock()
            .get(map)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn set_ex(&self, key: &str, val: &[u8], ttl: Duration) -> Result<()> {
        self.strings.lock().insert(
            key.to_string(),
            TtlEntry {
                value: val.to_vec(),
                deadline: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut strings = self.strings.lock();
        match strings.get(key) {
            Some(entry) if entry.fresh() => Ok(Some(entry.value.clone())),
            Some(_) => {
                strings.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.strings.lock().remove(key);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, val: &[u8], ttl: Duration) -> Result<bool> {
        let mut strings = self.strings.lock();
        if let Some(entry) = strings.get(key) {
            if entry.fresh() {
                return Ok(false);
            }
        }
        strings.insert(
            key.to_string(),
            TtlEntry {
                value: val.to_vec(),
                deadline: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn set_if_present(&self, key: &str, val: &[u8], ttl: Duration) -> Result<bool> {
        let mut strings = self.strings.lock();
        match strings.get(key) {
            Some(entry) if entry.fresh() => {
                strings.insert(
                    key.to_string(),
                    TtlEntry {
                        value: val.to_vec(),
                        deadline: Some(Instant::now() + ttl),
                    },
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut strings = self.strings.lock();
        if let Some(entry) = strings.get_mut(key) {
            if entry.fresh() {
                entry.deadline = Some(Instant::now() + ttl);
            }
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, msg: &[u8]) -> Result<()> {
        let mut channels = self.channels.lock();
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.retain(|tx| tx.send(msg.to_vec()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }

    async fn list_push(&self, queue: &str, msg: &[u8]) -> Result<()> {
        self.lists
            .lock()
            .entry(queue.to_string())
            .or_default()
            .push_back(msg.to_vec());
        Ok(())
    }

    async fn list_pop(&self, queue: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .lists
            .lock()
            .get_mut(queue)
            .and_then(|q| q.pop_front()))
    }

    async fn increment_by(&self, hash: &str, key: &str, delta: i64) -> Result<i64> {
        let mut hashes = self.hashes.lock();
        let map = hashes.entry(hash.to_string()).or_default();
        let current = map
            .get(key)
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + delta;
        map.insert(key.to_string(), next.to_string().into_bytes());
        Ok(next)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ttl_entries_expire_on_read() {
        let store = InMemoryStore::new();
        store
            .set_ex("hb", b"alive", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(store.get("hb").await.unwrap().as_deref(), Some(&b"alive"[..]));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("hb").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_if_absent_respects_fresh_holder() {
        let store = InMemoryStore::new();
        assert!(store
            .set_if_absent("lock", b"a", Duration::from_secs(30))
            .await
            .unwrap());
        assert!(!store
            .set_if_absent("lock", b"b", Duration::from_secs(30))
            .await
            .unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some(&b"a"[..]));
    }

    #[tokio::test]
    async fn set_if_absent_wins_after_expiry() {
        let store = InMemoryStore::new();
        assert!(store
            .set_if_absent("lock", b"a", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store
            .set_if_absent("lock", b"b", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn set_if_present_only_overwrites_existing() {
        let store = InMemoryStore::new();
        assert!(!store
            .set_if_present("lock", b"x", Duration::from_secs(30))
            .await
            .unwrap());
        store
            .set_ex("lock", b"a", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(store
            .set_if_present("lock", b"b", Duration::from_secs(30))
            .await
            .unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some(&b"b"[..]));
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let store = InMemoryStore::new();
        let mut sub_a = store.subscribe("events").await.unwrap();
        let mut sub_b = store.subscribe("events").await.unwrap();
        store.publish("events", b"hello").await.unwrap();
        assert_eq!(sub_a.recv().await.as_deref(), Some(&b"hello"[..]));
        assert_eq!(sub_b.recv().await.as_deref(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn list_is_fifo() {
        let store = InMemoryStore::new();
        store.list_push("q", b"1").await.unwrap();
        store.list_push("q", b"2").await.unwrap();
        assert_eq!(store.list_pop("q").await.unwrap().as_deref(), Some(&b"1"[..]));
        assert_eq!(store.list_pop("q").await.unwrap().as_deref(), Some(&b"2"[..]));
        assert_eq!(store.list_pop("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn counters_accumulate() {
        let store = InMemoryStore::new();
        assert_eq!(store.increment_by("progress", "k1", 5).await.unwrap(), 5);
        assert_eq!(store.increment_by("progress", "k1", 3).await.unwrap(), 8);
    }
}
