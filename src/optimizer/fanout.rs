//! Bounded-concurrency fan-out for market fetches.
//!
//! Markets are grouped by verse, each group is chunked, and the resulting
//! tasks run with at most N in flight: when the window is full, the next
//! task launches only after one settles.

use crate::models::VerseId;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use tracing::warn;

const CHUNK_SIZE: usize = 50;

/// Run `tasks` keeping at most `limit` in flight. Results are returned in
/// completion order; failed tasks are logged and skipped.
pub async fn run_bounded<T, E, Fut>(
    tasks: Vec<Fut>,
    limit: usize,
) -> Vec<T>
where
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let limit = limit.clamp(1, 10);
    let mut results = Vec::with_capacity(tasks.len());
    let mut in_flight = FuturesUnordered::new();
    let mut pending = tasks.into_iter();

    loop {
        while in_flight.len() < limit {
            match pending.next() {
                Some(task) => in_flight.push(task),
                None => break,
            }
        }
        match in_flight.next().await {
            Some(Ok(value)) => results.push(value),
            Some(Err(err)) => warn!(error = %err, "fan-out task failed"),
            None => break,
        }
    }
    results
}

/// Split `ids` into per-verse chunks of at most [`CHUNK_SIZE`] and fetch each
/// chunk via `fetch`, with `parallel` chunks in flight at once. Ids with no
/// known verse share one group.
pub async fn optimize_market_fetch<T, E, Fut>(
    ids: &[String],
    verse_of: impl Fn(&str) -> Option<VerseId>,
    parallel: usize,
    fetch: impl Fn(Vec<String>) -> Fut,
) -> Vec<T>
where
    Fut: Future<Output = Result<Vec<T>, E>>,
    E: std::fmt::Display,
{
    let mut by_verse: HashMap<Option<VerseId>, Vec<String>> = HashMap::new();
    for id in ids {
        by_verse.entry(verse_of(id)).or_default().push(id.clone());
    }

    let mut tasks = Vec::new();
    for group in by_verse.into_values() {
        for chunk in group.chunks(CHUNK_SIZE) {
            tasks.push(fetch(chunk.to_vec()));
        }
    }

    let chunks = run_bounded(tasks, parallel).await;
    chunks.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn bounded_window_never_exceeds_limit() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let current = current.clone();
                let peak = peak.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, std::convert::Infallible>(i)
                }
            })
            .collect();

        let results = run_bounded(tasks, 5).await;
        assert_eq!(results.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 5, "peak={}", peak.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failed_tasks_are_skipped() {
        let tasks: Vec<_> = (0..4)
            .map(|i| async move {
                if i % 2 == 0 {
                    Ok(i)
                } else {
                    Err(format!("task {i} failed"))
                }
            })
            .collect();
        let mut results = run_bounded(tasks, 2).await;
        results.sort();
        assert_eq!(results, vec![0, 2]);
    }

    #[tokio::test]
    async fn fetch_groups_by_verse_and_chunks() {
        let ids: Vec<String> = (0..120).map(|i| format!("m{i}")).collect();
        let calls = Arc::new(AtomicUsize::new(0));
        let probe = calls.clone();

        // Two verses, split odd/even: 60 ids each => 2 chunks per verse.
        let results = optimize_market_fetch(
            &ids,
            |id| {
                let n: u64 = id[1..].parse().unwrap();
                Some(VerseId((n % 2) as u128))
            },
            5,
            move |chunk| {
                let calls = probe.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    assert!(chunk.len() <= 50);
                    Ok::<_, std::convert::Infallible>(chunk)
                }
            },
        )
        .await;

        assert_eq!(results.len(), 120);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
