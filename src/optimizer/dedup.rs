//! Request deduplication.
//!
//! Identical keys share one in-flight call; completed results are memoized
//! for a TTL. Expired entries are swept whenever a new call is inserted.

use crate::ratelimit::RequestError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

enum Entry<T> {
    InFlight(Vec<oneshot::Sender<Result<T, String>>>),
    Cached { value: T, at: Instant },
}

pub struct RequestDeduplicator<T> {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry<T>>>,
}

impl<T: Clone + Send + 'static> RequestDeduplicator<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` for `key`, unless an identical call is already in flight (join
    /// it) or completed within the TTL (reuse it).
    pub async fn deduplicate<F, Fut>(&self, key: &str, f: F) -> Result<T, RequestError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        // One lock scope decides cached / join / lead, so two concurrent
        // callers can never both become the leader.
        let rx = {
            let mut entries = self.entries.lock();
            match entries.get_mut(key) {
                Some(Entry::Cached { value, at }) if at.elapsed() <= self.ttl => {
                    return Ok(value.clone());
                }
                Some(Entry::InFlight(waiters)) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                _ => {
                    // Sweep expired results on insert.
                    let ttl = self.ttl;
                    entries.retain(|_, entry| match entry {
                        Entry::Cached { at, .. } => at.elapsed() <= ttl,
                        Entry::InFlight(_) => true,
                    });
                    entries.insert(key.to_string(), Entry::InFlight(Vec::new()));
                    None
                }
            }
        };

        if let Some(rx) = rx {
            return match rx.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(RequestError::Persistent(err)),
                Err(_) => Err(RequestError::Transient("deduplicated call abandoned".into())),
            };
        }

        let result = f().await;

        let waiters = {
            let mut entries = self.entries.lock();
            let waiters = match entries.remove(key) {
                Some(Entry::InFlight(waiters)) => waiters,
                _ => Vec::new(),
            };
            if let Ok(value) = &result {
                entries.insert(
                    key.to_string(),
                    Entry::Cached { value: value.clone(), at: Instant::now() },
                );
            }
            waiters
        };

        match &result {
            Ok(value) => {
                for tx in waiters {
                    let _ = tx.send(Ok(value.clone()));
                }
            }
            Err(err) => {
                let msg = err.to_string();
                for tx in waiters {
                    let _ = tx.send(Err(msg.clone()));
                }
            }
        }
        result
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn concurrent_calls_share_one_invocation() {
        let dedup = Arc::new(RequestDeduplicator::new(Duration::from_secs(60)));
        let invocations = Arc::new(AtomicU32::new(0));

        let a = dedup.clone();
        let count_a = invocations.clone();
        let ha = tokio::spawn(async move {
            a.deduplicate("k", || async move {
                count_a.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, RequestError>(99u32)
            })
            .await
        });
        // Let the first call take the leader slot.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let b = dedup.clone();
        let count_b = invocations.clone();
        let hb = tokio::spawn(async move {
            b.deduplicate("k", || async move {
                count_b.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RequestError>(0u32)
            })
            .await
        });

        assert_eq!(ha.await.unwrap().unwrap(), 99);
        assert_eq!(hb.await.unwrap().unwrap(), 99);
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn completed_results_are_cached_within_ttl() {
        let dedup = RequestDeduplicator::new(Duration::from_secs(60));
        let invocations = AtomicU32::new(0);

        for _ in 0..3 {
            let value = dedup
                .deduplicate("k", || async {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, RequestError>(7u32)
                })
                .await
                .unwrap();
            assert_eq!(value, 7);
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entries_rerun() {
        let dedup = RequestDeduplicator::new(Duration::from_millis(20));
        let invocations = AtomicU32::new(0);

        for _ in 0..2 {
            dedup
                .deduplicate("k", || async {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, RequestError>(1u32)
                })
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let dedup = RequestDeduplicator::new(Duration::from_secs(60));
        let invocations = AtomicU32::new(0);

        let first: Result<u32, _> = dedup
            .deduplicate("k", || async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err(RequestError::Persistent("nope".into()))
            })
            .await;
        assert!(first.is_err());

        let second = dedup
            .deduplicate("k", || async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RequestError>(5u32)
            })
            .await
            .unwrap();
        assert_eq!(second, 5);
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }
}
