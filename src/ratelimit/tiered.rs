//! Tiered rate limiter.
//!
//! Every outbound provider call goes through `execute`: resolve the endpoint
//! to a class, take a token from that class's bucket (or queue behind it),
//! then run the call inside the retry loop. One token per call, not per
//! attempt.

use super::bucket::{PriorityQueue, TokenBucket};
use super::monitor::UsageMonitor;
use crate::config::{EndpointClass, TierLimits};
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::sleep;
use tracing::{debug, warn};

const MAX_RETRIES: u32 = 3;
const RETRY_BASE_MS: u64 = 100;
const TRANSIENT_RETRY_DELAY_MS: u64 = 250;

const REQUEST_LOG_CAP: usize = 1000;
const REQUEST_LOG_WINDOW_MS: i64 = 60_000;

/// Errors surfaced by rate-limited requests.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// Provider said 429. Retried with full-jitter backoff.
    #[error("rate limited by provider")]
    RateLimited,
    /// Connection resets, timeouts. Retried after a fixed short delay.
    #[error("transient network error: {0}")]
    Transient(String),
    /// Everything else surfaces immediately.
    #[error("{0}")]
    Persistent(String),
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl RequestError {
    fn is_retryable(&self) -> bool {
        matches!(self, RequestError::RateLimited | RequestError::Transient(_))
    }
}

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct QueuedJob {
    job: Job,
    /// Sender whose receiver half lives in the caller; once the caller is
    /// gone the job must not spend a token.
    cancel_probe: oneshot::Sender<()>,
}

impl QueuedJob {
    fn cancelled(&self) -> bool {
        self.cancel_probe.is_closed()
    }
}

struct ClassQueue {
    queue: Mutex<PriorityQueue<QueuedJob>>,
    notify: Notify,
}

#[derive(Debug, Clone, Copy)]
struct LogEntry {
    class: EndpointClass,
    ts_ms: i64,
    success: bool,
}

/// Per-endpoint-class token buckets with a priority queue and a dedicated
/// drainer task per class.
pub struct TieredRateLimiter {
    base_limits: TierLimits,
    emergency: Mutex<bool>,
    buckets: RwLock<HashMap<EndpointClass, Arc<TokenBucket>>>,
    queues: HashMap<EndpointClass, ClassQueue>,
    monitor: Arc<UsageMonitor>,
    request_log: Mutex<VecDeque<LogEntry>>,
}

impl TieredRateLimiter {
    /// Build the limiter and spawn one queue drainer per endpoint class.
    pub fn spawn(limits: TierLimits, monitor: Arc<UsageMonitor>) -> Arc<Self> {
        let mut buckets = HashMap::new();
        let mut queues = HashMap::new();
        for class in EndpointClass::ALL {
            let limit = limits.get(class);
            buckets.insert(
                class,
                Arc::new(TokenBucket::new(limit.rate, limit.per, limit.burst)),
            );
            queues.insert(
                class,
                ClassQueue {
                    queue: Mutex::new(PriorityQueue::new()),
                    notify: Notify::new(),
                },
            );
        }

        let limiter = Arc::new(Self {
            base_limits: limits,
            emergency: Mutex::new(false),
            buckets: RwLock::new(buckets),
            queues,
            monitor,
            request_log: Mutex::new(VecDeque::with_capacity(REQUEST_LOG_CAP)),
        });

        for class in EndpointClass::ALL {
            let drainer = limiter.clone();
            tokio::spawn(async move {
                drainer.drain_queue(class).await;
            });
        }

        limiter
    }

    fn bucket(&self, class: EndpointClass) -> Arc<TokenBucket> {
        self.buckets
            .read()
            .get(&class)
            .cloned()
            .expect("bucket exists for every class")
    }

    /// Toggle emergency mode. Buckets are rebuilt wholesale under the write
    /// lock, so `try_consume` never observes a half-swapped set; current
    /// token counts are discarded.
    pub fn set_emergency_mode(&self, on: bool) {
        let mut emergency = self.emergency.lock();
        if *emergency == on {
            return;
        }
        *emergency = on;
        let limits = if on {
            self.base_limits.halved()
        } else {
            self.base_limits
        };
        let mut rebuilt = HashMap::new();
        for class in EndpointClass::ALL {
            let limit = limits.get(class);
            rebuilt.insert(
                class,
                Arc::new(TokenBucket::new(limit.rate, limit.per, limit.burst)),
            );
        }
        *self.buckets.write() = rebuilt;
        warn!(emergency = on, "rate limiter emergency mode toggled");
    }

    pub fn emergency_mode(&self) -> bool {
        *self.emergency.lock()
    }

    pub fn queue_depth(&self, class: EndpointClass) -> usize {
        self.queues[&class].queue.lock().len()
    }

    /// Execute `f` against `endpoint` at `priority`. Takes the fast path when
    /// a token is immediately available, otherwise queues behind the class
    /// drainer.
    pub async fn execute<T, F, Fut>(
        self: &Arc<Self>,
        endpoint: &str,
        priority: u8,
        f: F,
    ) -> Result<T, RequestError>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, RequestError>> + Send,
    {
        let class = EndpointClass::for_endpoint(endpoint);
        let endpoint = endpoint.to_string();

        if self.bucket(class).try_consume(1) {
            return self.run_with_retry(&endpoint, class, &f).await;
        }

        // Queue path: the drainer takes the token and runs the retry loop,
        // sending the outcome back through a oneshot.
        let (tx, rx) = oneshot::channel::<Result<T, RequestError>>();
        let (probe_tx, probe_rx) = oneshot::channel::<()>();
        let limiter = self.clone();

        let job: Job = Box::new(move || {
            Box::pin(async move {
                let result = limiter.run_with_retry(&endpoint, class, &f).await;
                let _ = tx.send(result);
            })
        });
        {
            let slot = &self.queues[&class];
            slot.queue.lock().enqueue(
                priority,
                QueuedJob {
                    job,
                    cancel_probe: probe_tx,
                },
            );
            slot.notify.notify_one();
        }

        // Holding the receiver keeps the probe open; dropping this future
        // closes it and the drainer skips the job.
        let _cancel_guard = probe_rx;
        rx.await
            .map_err(|_| RequestError::Transient("rate limiter drainer dropped request".into()))?
    }

    async fn run_with_retry<T, F, Fut>(
        &self,
        endpoint: &str,
        class: EndpointClass,
        f: &F,
    ) -> Result<T, RequestError>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, RequestError>> + Send,
    {
        // One usage record per call: retries ride the same token.
        self.monitor.record(endpoint);

        let mut attempt = 0u32;
        loop {
            match f().await {
                Ok(value) => {
                    self.log_request(class, true);
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < MAX_RETRIES => {
                    let delay = match &err {
                        RequestError::RateLimited => {
                            let jitter = rand::thread_rng().gen_range(0..=RETRY_BASE_MS);
                            Duration::from_millis(2u64.pow(attempt) * RETRY_BASE_MS + jitter)
                        }
                        _ => Duration::from_millis(TRANSIENT_RETRY_DELAY_MS),
                    };
                    attempt += 1;
                    debug!(
                        endpoint,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying request"
                    );
                    self.log_request(class, false);
                    sleep(delay).await;
                }
                Err(err) if err.is_retryable() => {
                    self.log_request(class, false);
                    return Err(RequestError::RetriesExhausted {
                        attempts: attempt,
                        last: err.to_string(),
                    });
                }
                Err(err) => {
                    self.log_request(class, false);
                    return Err(err);
                }
            }
        }
    }

    /// Dedicated long-running drainer for one class; blocks only on token
    /// availability or the wrapped call.
    async fn drain_queue(self: Arc<Self>, class: EndpointClass) {
        loop {
            let next = self.queues[&class].queue.lock().dequeue();
            let Some(queued) = next else {
                self.queues[&class].notify.notified().await;
                continue;
            };
            if queued.cancelled() {
                continue;
            }
            self.wait_token(class).await;
            if queued.cancelled() {
                // Token taken but the wrapped call never ran; hand it back.
                self.bucket(class).refund(1);
                continue;
            }
            (queued.job)().await;
        }
    }

    /// Token wait that re-fetches the bucket every round so an emergency
    /// rebuild takes effect for queued work too.
    async fn wait_token(&self, class: EndpointClass) {
        loop {
            let bucket = self.bucket(class);
            if bucket.try_consume(1) {
                return;
            }
            let deficit = (1.0 - bucket.available()).max(0.0);
            let wait = Duration::from_secs_f64(deficit / bucket.rate().max(f64::EPSILON));
            sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    fn log_request(&self, class: EndpointClass, success: bool) {
        let now = crate::models::now_ms();
        let mut log = self.request_log.lock();
        while log.len() >= REQUEST_LOG_CAP {
            log.pop_front();
        }
        while let Some(front) = log.front() {
            if now - front.ts_ms > REQUEST_LOG_WINDOW_MS {
                log.pop_front();
            } else {
                break;
            }
        }
        log.push_back(LogEntry {
            class,
            ts_ms: now,
            success,
        });
    }

    /// Recommended pause before the next call to this endpoint, derived from
    /// the rolling failure rate over the last minute.
    pub fn recommended_backoff(&self, endpoint: &str) -> Duration {
        let class = EndpointClass::for_endpoint(endpoint);
        let now = crate::models::now_ms();
        let log = self.request_log.lock();
        let (mut total, mut failures) = (0u32, 0u32);
        for entry in log.iter() {
            if entry.class == class && now - entry.ts_ms <= REQUEST_LOG_WINDOW_MS {
                total += 1;
                if !entry.success {
                    failures += 1;
                }
            }
        }
        if total == 0 {
            return Duration::from_secs(1);
        }
        let failure_rate = failures as f64 / total as f64;
        if failure_rate > 0.5 {
            Duration::from_secs(5)
        } else if failure_rate > 0.2 {
            Duration::from_secs(2)
        } else {
            Duration::from_secs(1)
        }
    }
}
