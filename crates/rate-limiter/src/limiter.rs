//! Rate limiter state machine
//!
//! State (start timestamps + wait queue) lives behind one `parking_lot`
//! mutex. The drain step runs synchronously whenever a task is enqueued and
//! whenever the single pending timer fires. Callbacks and logging happen
//! after the lock is released.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Reported to `on_warning` when the queue is near or at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueWarning {
    pub queue_size: usize,
    pub max_queue: usize,
}

type WarningCallback = Arc<dyn Fn(QueueWarning) + Send + Sync>;
type QueueChangeCallback = Arc<dyn Fn(usize) + Send + Sync>;

#[derive(Clone)]
pub struct RateLimiterOptions {
    pub max_requests_per_interval: usize,
    pub interval: Duration,
    /// Unbounded when `None`.
    pub max_queue: Option<usize>,
    /// Entries waiting longer than this are rejected instead of started.
    pub max_queue_wait: Option<Duration>,
    pub warn_at_fraction: f64,
    pub on_warning: Option<WarningCallback>,
    pub on_queue_change: Option<QueueChangeCallback>,
    /// Label for logs and the queue-depth gauge (`api`, `bulk_download`, ...).
    pub scope: String,
}

impl RateLimiterOptions {
    pub fn new(max_requests_per_interval: usize, interval: Duration) -> Self {
        Self {
            max_requests_per_interval,
            interval,
            ..Self::default()
        }
    }
}

impl Default for RateLimiterOptions {
    fn default() -> Self {
        Self {
            max_requests_per_interval: 100,
            interval: Duration::from_secs(60),
            max_queue: None,
            max_queue_wait: None,
            warn_at_fraction: 0.8,
            on_warning: None,
            on_queue_change: None,
            scope: "api".to_string(),
        }
    }
}

impl fmt::Debug for RateLimiterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiterOptions")
            .field("max_requests_per_interval", &self.max_requests_per_interval)
            .field("interval", &self.interval)
            .field("max_queue", &self.max_queue)
            .field("max_queue_wait", &self.max_queue_wait)
            .field("warn_at_fraction", &self.warn_at_fraction)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

struct QueueEntry {
    admit: oneshot::Sender<Result<()>>,
    enqueued_at: Instant,
}

#[derive(Default)]
struct State {
    timestamps: VecDeque<Instant>,
    queue: VecDeque<QueueEntry>,
    timer: Option<JoinHandle<()>>,
    closed: bool,
}

impl State {
    /// Forget starts that fell out of the trailing window.
    fn trim(&mut self, now: Instant, interval: Duration) {
        let Some(cutoff) = now.checked_sub(interval) else {
            return;
        };
        while self.timestamps.front().is_some_and(|t| *t <= cutoff) {
            self.timestamps.pop_front();
        }
    }

    /// Time until another start fits in the window; zero if one fits now.
    fn delay_until_next_start(&mut self, now: Instant, max: usize, interval: Duration) -> Duration {
        self.trim(now, interval);
        if self.timestamps.len() < max {
            return Duration::ZERO;
        }
        match self.timestamps.front() {
            Some(earliest) => (*earliest + interval).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }
}

struct Inner {
    max_requests: usize,
    interval: Duration,
    max_queue: Option<usize>,
    max_queue_wait: Option<Duration>,
    warn_at_fraction: f64,
    on_warning: Option<WarningCallback>,
    on_queue_change: Option<QueueChangeCallback>,
    scope: String,
    state: Mutex<State>,
}

/// Sliding-window start-rate limiter with a bounded FIFO wait queue.
///
/// Cheap to clone; clones share the same window and queue.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    pub fn new(options: RateLimiterOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_requests: options.max_requests_per_interval.max(1),
                interval: options.interval,
                max_queue: options.max_queue,
                max_queue_wait: options.max_queue_wait,
                warn_at_fraction: options.warn_at_fraction,
                on_warning: options.on_warning,
                on_queue_change: options.on_queue_change,
                scope: options.scope,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn scope(&self) -> &str {
        &self.inner.scope
    }

    /// Wait for admission, then run `task` on the caller's task.
    ///
    /// The limiter does not wait for `task` to finish before admitting the
    /// next entry, so several admitted tasks may be in flight at once.
    pub async fn schedule<F, Fut>(&self, task: F) -> Result<Fut::Output>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        self.acquire().await?;
        Ok(task().await)
    }

    /// Wait until a start is admitted.
    ///
    /// The capacity check and enqueue happen on the first poll, before any
    /// suspension.
    pub async fn acquire(&self) -> Result<()> {
        let admitted = self.enqueue()?;
        match admitted.await {
            Ok(result) => result,
            // Sender dropped without a verdict: the queue was torn down.
            Err(_) => Err(Error::Closed),
        }
    }

    fn enqueue(&self) -> Result<oneshot::Receiver<Result<()>>> {
        let (tx, rx) = oneshot::channel();
        let size = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::Closed);
            }
            if let Some(limit) = self.inner.max_queue {
                if state.queue.len() >= limit {
                    let queue_size = state.queue.len();
                    drop(state);
                    self.inner.warn(queue_size, limit);
                    return Err(Error::QueueFull { limit });
                }
            }
            state.queue.push_back(QueueEntry {
                admit: tx,
                enqueued_at: Instant::now(),
            });
            state.queue.len()
        };

        self.inner.queue_changed(size);
        self.inner.maybe_warn(size);
        drain(&self.inner);
        Ok(rx)
    }

    /// Number of entries waiting for admission.
    pub fn queue_size(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Reject every queued entry and cancel the pending timer.
    pub fn close(&self) {
        let (entries, timer) = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            (std::mem::take(&mut state.queue), state.timer.take())
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        let rejected = entries.len();
        for entry in entries {
            let _ = entry.admit.send(Err(Error::Closed));
        }
        if rejected > 0 {
            debug!(scope = %self.inner.scope, rejected, "rate limiter closed with queued entries");
        }
        self.inner.queue_changed(0);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

impl Inner {
    fn queue_changed(&self, size: usize) {
        metrics::gauge!("crm_rate_limiter_queue_depth", "scope" => self.scope.clone())
            .set(size as f64);
        if let Some(callback) = &self.on_queue_change {
            callback(size);
        }
    }

    fn maybe_warn(&self, size: usize) {
        let Some(limit) = self.max_queue else {
            return;
        };
        let warn_at = (limit as f64 * self.warn_at_fraction).ceil() as usize;
        if size >= warn_at {
            self.warn(size, limit);
        }
    }

    fn warn(&self, queue_size: usize, max_queue: usize) {
        warn!(scope = %self.scope, queue_size, max_queue, "rate limiter queue near capacity");
        if let Some(callback) = &self.on_warning {
            callback(QueueWarning {
                queue_size,
                max_queue,
            });
        }
    }
}

/// Admit as many queued entries as the window allows, then arm a timer for
/// the next free slot if entries remain. Observers see the depth after every
/// dequeue, in order.
fn drain(inner: &Arc<Inner>) {
    let mut expired = 0usize;
    let sizes = {
        let mut state = inner.state.lock();
        if state.closed {
            return;
        }

        let mut sizes = Vec::new();
        while !state.queue.is_empty() {
            let now = Instant::now();
            let delay = state.delay_until_next_start(now, inner.max_requests, inner.interval);
            if !delay.is_zero() {
                arm_timer(inner, &mut state, delay);
                break;
            }

            let Some(entry) = state.queue.pop_front() else {
                break;
            };
            sizes.push(state.queue.len());

            if let Some(limit) = inner.max_queue_wait {
                if now.duration_since(entry.enqueued_at) > limit {
                    let _ = entry.admit.send(Err(Error::WaitExceeded { limit }));
                    expired += 1;
                    continue;
                }
            }

            state.timestamps.push_back(now);
            if entry.admit.send(Ok(())).is_err() {
                // Waiter gave up before admission; the slot was never used.
                state.timestamps.pop_back();
            }
        }
        sizes
    };

    if expired > 0 {
        warn!(scope = %inner.scope, expired, "rate limiter entries exceeded max queue wait");
    }
    for size in sizes {
        inner.queue_changed(size);
    }
}

fn arm_timer(inner: &Arc<Inner>, state: &mut State, delay: Duration) {
    if state.timer.is_some() {
        return;
    }
    let weak: Weak<Inner> = Arc::downgrade(inner);
    state.timer = Some(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(inner) = weak.upgrade() {
            inner.state.lock().timer = None;
            drain(&inner);
        }
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn limiter(max: usize, interval_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimiterOptions::new(
            max,
            Duration::from_millis(interval_ms),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn one_per_second_spaces_starts() {
        let limiter = limiter(1, 1000);
        let origin = Instant::now();

        let runs = (0..3).map(|_| {
            let limiter = limiter.clone();
            async move { limiter.schedule(|| async { origin.elapsed() }).await.unwrap() }
        });
        let starts = futures::future::join_all(runs).await;

        assert_eq!(starts[0], Duration::ZERO);
        assert!(starts[1] >= Duration::from_millis(1000), "{starts:?}");
        assert!(starts[2] >= Duration::from_millis(2000), "{starts:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn window_never_exceeds_limit() {
        let limiter = limiter(3, 1000);
        let origin = Instant::now();

        let runs = (0..10).map(|_| {
            let limiter = limiter.clone();
            async move { limiter.schedule(|| async { origin.elapsed() }).await.unwrap() }
        });
        let starts = futures::future::join_all(runs).await;

        for (i, start) in starts.iter().enumerate() {
            let in_window = starts
                .iter()
                .filter(|s| **s >= *start && **s < *start + Duration::from_millis(1000))
                .count();
            assert!(in_window <= 3, "start {i} at {start:?} has {in_window} in window");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn admission_is_fifo() {
        let limiter = limiter(1, 100);
        let order = Arc::new(Mutex::new(Vec::new()));

        let runs = (0..5).map(|i| {
            let limiter = limiter.clone();
            let order = Arc::clone(&order);
            async move {
                limiter
                    .schedule(|| async move { order.lock().push(i) })
                    .await
                    .unwrap()
            }
        });
        futures::future::join_all(runs).await;
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn third_call_rejected_when_queue_full() {
        let limiter = RateLimiter::new(RateLimiterOptions {
            max_queue: Some(1),
            ..RateLimiterOptions::new(1, Duration::from_secs(1))
        });

        let first = limiter.acquire();
        let second = limiter.acquire();
        let third = limiter.acquire();
        tokio::pin!(first, second);

        // First poll of each enqueues; the first is admitted immediately.
        assert!(futures::poll!(&mut first).is_ready());
        assert!(futures::poll!(&mut second).is_pending());
        assert_eq!(third.await, Err(Error::QueueFull { limit: 1 }));
        assert!(second.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn admitted_tasks_run_concurrently() {
        let limiter = limiter(2, 1000);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let runs = (0..4).map(|_| {
            let limiter = limiter.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                limiter
                    .schedule(|| async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap()
            }
        });
        futures::future::join_all(runs).await;
        // Starts are paced, but slow tasks overlap beyond the per-window count.
        assert_eq!(peak.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entries_rejected_after_max_wait() {
        let limiter = RateLimiter::new(RateLimiterOptions {
            max_queue_wait: Some(Duration::from_millis(500)),
            ..RateLimiterOptions::new(1, Duration::from_secs(1))
        });

        let (a, b) = tokio::join!(limiter.acquire(), limiter.acquire());
        assert!(a.is_ok());
        assert_eq!(
            b,
            Err(Error::WaitExceeded {
                limit: Duration::from_millis(500)
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn close_rejects_queued_entries() {
        let limiter = limiter(1, 60_000);
        limiter.acquire().await.unwrap();

        let waiting = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await })
        };
        tokio::task::yield_now().await;
        assert_eq!(limiter.queue_size(), 1);

        limiter.close();
        assert_eq!(waiting.await.unwrap(), Err(Error::Closed));
        assert_eq!(limiter.acquire().await, Err(Error::Closed));
        assert_eq!(limiter.queue_size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn warning_fires_near_capacity() {
        let warnings = Arc::new(Mutex::new(Vec::new()));
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let limiter = RateLimiter::new(RateLimiterOptions {
            max_queue: Some(5),
            warn_at_fraction: 0.6,
            on_warning: Some({
                let warnings = Arc::clone(&warnings);
                Arc::new(move |w: QueueWarning| warnings.lock().push(w))
            }),
            on_queue_change: Some({
                let sizes = Arc::clone(&sizes);
                Arc::new(move |n: usize| sizes.lock().push(n))
            }),
            ..RateLimiterOptions::new(1, Duration::from_secs(60))
        });

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire().await })
            })
            .collect();
        tokio::task::yield_now().await;

        // One admitted, three queued; ceil(5 * 0.6) = 3 triggers once.
        assert_eq!(limiter.queue_size(), 3);
        assert_eq!(
            *warnings.lock(),
            vec![QueueWarning {
                queue_size: 3,
                max_queue: 5
            }]
        );
        assert!(sizes.lock().contains(&3));

        limiter.close();
        for waiter in waiters {
            let _ = waiter.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queue_depth_is_reported_after_every_dequeue() {
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let limiter = RateLimiter::new(RateLimiterOptions {
            on_queue_change: Some({
                let sizes = Arc::clone(&sizes);
                Arc::new(move |n: usize| sizes.lock().push(n))
            }),
            ..RateLimiterOptions::new(2, Duration::from_secs(60))
        });

        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();
        let mut waiters = Vec::new();
        for _ in 0..2 {
            let limiter = limiter.clone();
            waiters.push(tokio::spawn(async move { limiter.acquire().await }));
            tokio::task::yield_now().await;
        }
        assert_eq!(limiter.queue_size(), 2);

        // Both queued entries are admitted by one drain.
        tokio::time::advance(Duration::from_millis(60_000)).await;
        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
        assert_eq!(*sizes.lock(), vec![1, 0, 1, 0, 1, 2, 1, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_waiter_does_not_consume_slot() {
        let limiter = limiter(1, 1000);
        limiter.acquire().await.unwrap();

        {
            let abandoned = limiter.acquire();
            tokio::pin!(abandoned);
            assert!(futures::poll!(&mut abandoned).is_pending());
        }

        tokio::time::advance(Duration::from_millis(1000)).await;
        tokio::task::yield_now().await;
        // The abandoned entry was popped without recording a start.
        let origin = Instant::now();
        limiter.acquire().await.unwrap();
        assert_eq!(origin.elapsed(), Duration::ZERO);
    }
}
