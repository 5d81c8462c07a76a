//! Rate-limited request dispatch
//!
//! Serializes outbound REST calls so that at most `calls_in_period` start
//! inside any rolling `period`. A slot is held for at least one period
//! regardless of how fast the request returns. Calls answered with 429 are
//! retried from the front of the queue with exponential backoff until
//! their ttl runs out.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::config::QueueConfig;
use crate::error::{Result, SyncError};

type RequestFn<A, T> = Arc<dyn Fn(A) -> BoxFuture<'static, Result<T>> + Send + Sync>;

struct QueueEntry<A, T> {
    args: A,
    /// Retries remaining.
    ttl: u32,
    /// Delay before the next attempt.
    wait: Duration,
    reply: oneshot::Sender<Result<T>>,
}

struct QueueState<A, T> {
    queue: VecDeque<QueueEntry<A, T>>,
    in_flight: usize,
}

struct QueueInner<A, T> {
    request_fn: RequestFn<A, T>,
    config: QueueConfig,
    state: Mutex<QueueState<A, T>>,
}

impl<A, T> QueueInner<A, T> {
    fn lock(&self) -> MutexGuard<'_, QueueState<A, T>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub struct RequestQueue<A, T> {
    inner: Arc<QueueInner<A, T>>,
}

impl<A, T> Clone for RequestQueue<A, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, T> RequestQueue<A, T>
where
    A: Clone + Send + 'static,
    T: Send + 'static,
{
    pub fn create<F, Fut>(config: QueueConfig, request_fn: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let request_fn: RequestFn<A, T> = Arc::new(move |args| request_fn(args).boxed());
        Self {
            inner: Arc::new(QueueInner {
                request_fn,
                config,
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    in_flight: 0,
                }),
            }),
        }
    }

    /// Queue a call and wait for its result. Dropping the returned future
    /// does not cancel the call.
    pub async fn dispatch(&self, args: A) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.inner.lock().queue.push_back(QueueEntry {
            args,
            ttl: self.inner.config.default_ttl,
            wait: Duration::ZERO,
            reply,
        });
        Self::shift(&self.inner);
        rx.await
            .map_err(|_| SyncError::InvalidState("request queue dropped the call".into()))?
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    fn shift(inner: &Arc<QueueInner<A, T>>) {
        loop {
            let entry = {
                let mut state = inner.lock();
                if state.in_flight >= inner.config.calls_in_period.max(1) {
                    return;
                }
                let Some(entry) = state.queue.pop_front() else {
                    return;
                };
                state.in_flight += 1;
                entry
            };
            tokio::spawn(Self::call(Arc::clone(inner), entry));
        }
    }

    async fn call(inner: Arc<QueueInner<A, T>>, mut entry: QueueEntry<A, T>) {
        let period = inner.config.period();
        if !entry.wait.is_zero() {
            tokio::time::sleep(entry.wait).await;
        }
        // The slot is held for a full period from the moment the request starts.
        let start = Instant::now();

        match (inner.request_fn)(entry.args.clone()).await {
            Err(e) if e.is_rate_limited() && entry.ttl > 0 => {
                entry.ttl -= 1;
                let exponent = inner.config.default_ttl - entry.ttl;
                entry.wait = period * 2u32.saturating_pow(exponent);
                log::warn!(
                    "rate limited, retrying in {:?} ({} retries left)",
                    entry.wait,
                    entry.ttl
                );
                inner.lock().queue.push_front(entry);
            }
            result => {
                if let Err(e) = &result {
                    log::debug!("queued request failed: {e}");
                }
                let _ = entry.reply.send(result);
            }
        }

        let elapsed = start.elapsed();
        if elapsed < period {
            tokio::time::sleep(period - elapsed).await;
        }
        inner.lock().in_flight -= 1;
        Self::shift(&inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(calls_in_period: usize, period_ms: u64, default_ttl: u32) -> QueueConfig {
        QueueConfig {
            period_ms,
            calls_in_period,
            default_ttl,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_caps_calls_per_period() {
        let starts = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&starts);
        let queue = RequestQueue::create(config(7, 1000, 5), move |n: usize| {
            let recorded = Arc::clone(&recorded);
            async move {
                recorded.lock().unwrap().push(Instant::now());
                Ok::<_, SyncError>(n * 2)
            }
        });

        let begin = Instant::now();
        let results = join_all((0..20).map(|n| queue.dispatch(n))).await;
        assert_eq!(
            results.into_iter().map(|r| r.unwrap()).collect::<Vec<_>>(),
            (0..20).map(|n| n * 2).collect::<Vec<_>>()
        );

        let starts = starts.lock().unwrap().clone();
        assert_eq!(starts.len(), 20);
        for window_start in &starts {
            let in_window = starts
                .iter()
                .filter(|t| {
                    **t >= *window_start && **t < *window_start + Duration::from_millis(1000)
                })
                .count();
            assert!(in_window <= 7, "{in_window} calls started within one period");
        }
        assert!(Instant::now() - begin >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_amid_backlog_respects_window() {
        let starts = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&starts);
        let failed_once = Arc::new(AtomicUsize::new(0));
        let queue = RequestQueue::create(config(2, 100, 3), move |n: usize| {
            recorded.lock().unwrap().push((n, Instant::now()));
            let throttled = n == 0 && failed_once.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                if throttled {
                    Err(SyncError::RateLimited)
                } else {
                    Ok(n)
                }
            }
        });

        let results = join_all((0..8).map(|n| queue.dispatch(n))).await;
        assert!(results.iter().all(|r| r.is_ok()));

        let starts = starts.lock().unwrap().clone();
        assert_eq!(starts.len(), 9, "eight calls plus one retry");
        for (_, window_start) in &starts {
            let in_window = starts
                .iter()
                .filter(|(_, t)| {
                    *t >= *window_start && *t < *window_start + Duration::from_millis(100)
                })
                .count();
            assert!(in_window <= 2, "{in_window} starts within one period: {starts:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_capacity_still_dispatches() {
        let queue = RequestQueue::create(config(0, 100, 3), |n: u32| async move {
            Ok::<_, SyncError>(n + 1)
        });
        let result = tokio::time::timeout(Duration::from_secs(5), queue.dispatch(1)).await;
        assert_eq!(result.ok(), Some(Ok(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_until_ttl_exhausted() {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&attempts);
        let queue = RequestQueue::create(config(7, 100, 3), move |_: ()| {
            let recorded = Arc::clone(&recorded);
            async move {
                recorded.lock().unwrap().push(Instant::now());
                Err::<(), _>(SyncError::RateLimited)
            }
        });

        assert_eq!(queue.dispatch(()).await, Err(SyncError::RateLimited));

        let attempts = attempts.lock().unwrap().clone();
        assert_eq!(attempts.len(), 4, "one call plus three retries");
        let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        for (n, gap) in gaps.iter().enumerate() {
            let backoff = Duration::from_millis(100) * 2u32.pow(n as u32 + 1);
            assert!(*gap >= backoff, "retry {n} waited {gap:?}, expected at least {backoff:?}");
        }
        assert!(gaps.windows(2).all(|w| w[1] > w[0]), "waits must grow: {gaps:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let queue = RequestQueue::create(config(7, 100, 3), move |_: ()| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(SyncError::ValidationRejected("bad".into())) }
        });

        assert!(matches!(queue.dispatch(()).await, Err(SyncError::ValidationRejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_keeps_its_place_at_the_front() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let failed_once = Arc::new(AtomicUsize::new(0));
        let recorded = Arc::clone(&order);
        let queue = RequestQueue::create(config(1, 100, 3), move |name: &'static str| {
            recorded.lock().unwrap().push(name);
            let first_a = name == "a" && failed_once.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                if first_a {
                    Err(SyncError::RateLimited)
                } else {
                    Ok(name)
                }
            }
        });

        let (a, b) = tokio::join!(queue.dispatch("a"), queue.dispatch("b"));
        assert_eq!(a, Ok("a"));
        assert_eq!(b, Ok("b"));
        assert_eq!(*order.lock().unwrap(), vec!["a", "a", "b"]);
        assert_eq!(queue.in_flight(), 1, "last slot is still cooling down");
    }
}
