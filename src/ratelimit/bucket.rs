//! Token bucket and priority queue primitives.
//!
//! The bucket refills lazily: every access first credits elapsed time at the
//! configured rate, capped at capacity. Tokens are never minted without
//! elapsed-time accounting.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};
use tokio::time::sleep;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    max_tokens: f64,
    /// Tokens per second.
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// `rate` tokens per `per`, with `burst` capacity. Starts full.
    pub fn new(rate: u32, per: Duration, burst: u32) -> Self {
        let refill_rate = rate as f64 / per.as_secs_f64().max(f64::EPSILON);
        Self {
            max_tokens: burst as f64,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        state.last_refill = now;
    }

    /// Take `n` tokens if available right now.
    pub fn try_consume(&self, n: u32) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        let n = n as f64;
        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Suspend until `n` tokens can be taken. Sleeps for the computed
    /// shortfall each round rather than spinning.
    pub async fn wait_for_tokens(&self, n: u32) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state);
                let need = n as f64 - state.tokens;
                if need <= 0.0 {
                    state.tokens -= n as f64;
                    return;
                }
                Duration::from_secs_f64(need / self.refill_rate)
            };
            // Floor at 1ms so a tiny shortfall still yields.
            sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Return tokens reserved for work that never ran. Capped at capacity,
    /// so a refund never mints tokens.
    pub fn refund(&self, n: u32) {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens = (state.tokens + n as f64).min(self.max_tokens);
    }

    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.max_tokens
    }

    /// Tokens per second.
    pub fn rate(&self) -> f64 {
        self.refill_rate
    }
}

struct Entry<T> {
    priority: u8,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority wins; within a band, earlier enqueue wins.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue ordered by `(priority desc, enqueue order asc)`.
pub struct PriorityQueue<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn enqueue(&mut self, priority: u8, item: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { priority, seq, item });
    }

    pub fn dequeue(&mut self) -> Option<T> {
        self.heap.pop().map(|e| e.item)
    }

    pub fn peek(&self) -> Option<&T> {
        self.heap.peek().map(|e| &e.item)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
