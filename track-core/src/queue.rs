//! Job-queue binding: at-least-once dispatch of one job per raw sample id to
//! a pool of `W` parallel workers, with id-based dedup, exponential-backoff
//! retry, a process-wide start-rate cap, and bounded retention of completed
//! and failed jobs.
//!
//! Global state here — the dedup/retention map and the dispatch loop — is an
//! explicit collaborator the worker entrypoint constructs and owns, not a
//! static; restarting the process simply forgets in-flight and retained jobs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::QueueError;

/// One unit of work: handle the job identified by `raw_sample_id` to
/// completion. Implementations must be safe to invoke more than once for the
/// same id (at-least-once delivery).
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, raw_sample_id: Uuid) -> Result<(), JobFailure>;
}

/// Whether a handler failure should be retried.
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub message: String,
    pub retriable: bool,
}

impl JobFailure {
    pub fn retriable(message: impl Into<String>) -> Self {
        Self { message: message.into(), retriable: true }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self { message: message.into(), retriable: false }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Parallel workers processing jobs.
    pub concurrency: usize,
    /// Process-wide job-start cap, starts per second.
    pub rate_limit: u32,
    /// Maximum attempts before a job is dead-lettered.
    pub max_attempts: u32,
    /// Base exponential-backoff delay between attempts.
    pub retry_base: Duration,
    pub completed_retention: usize,
    pub completed_retention_age: Duration,
    pub failed_retention: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            rate_limit: 100,
            max_attempts: 3,
            retry_base: Duration::from_secs(2),
            completed_retention: 1000,
            completed_retention_age: Duration::from_secs(24 * 60 * 60),
            failed_retention: 5000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy)]
enum Record {
    InFlight,
    #[allow(dead_code)]
    Retained {
        outcome: JobOutcome,
        at: Instant,
    },
}

struct RetentionEntry {
    id: Uuid,
    at: Instant,
}

/// A simple token bucket refilling continuously at `rate` tokens/second,
/// capacity capped at one second's worth of tokens.
struct RateLimiter {
    rate: f64,
    state: Mutex<(f64, Instant)>,
}

impl RateLimiter {
    fn new(rate: u32) -> Self {
        let rate = rate.max(1) as f64;
        Self {
            rate,
            state: Mutex::new((rate, Instant::now())),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap();
                let now = Instant::now();
                let elapsed = now.duration_since(state.1).as_secs_f64();
                state.1 = now;
                state.0 = (state.0 + elapsed * self.rate).min(self.rate);

                if state.0 >= 1.0 {
                    state.0 -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - state.0;
                    Some(Duration::from_secs_f64(deficit / self.rate))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

struct QueueInner {
    handler: Arc<dyn JobHandler>,
    config: QueueConfig,
    dedup: dashmap::DashMap<Uuid, Record>,
    completed_order: Mutex<VecDeque<RetentionEntry>>,
    failed_order: Mutex<VecDeque<RetentionEntry>>,
    semaphore: Arc<Semaphore>,
    rate_limiter: Arc<RateLimiter>,
    draining: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
    tx: mpsc::UnboundedSender<Uuid>,
}

/// The job-queue binding. Cheaply cloneable; every clone shares the same
/// dispatch loop, dedup map, and retention history.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    pub fn new(handler: Arc<dyn JobHandler>, config: QueueConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(QueueInner {
            handler,
            config,
            dedup: dashmap::DashMap::new(),
            completed_order: Mutex::new(VecDeque::new()),
            failed_order: Mutex::new(VecDeque::new()),
            semaphore: Arc::new(Semaphore::new(config.concurrency)),
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit)),
            draining: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            tx,
        });

        tokio::spawn(dispatch_loop(inner.clone(), rx));

        Self { inner }
    }

    /// Enqueue a job keyed by `raw_sample_id`. Coalesces with an id that is
    /// already in-flight or still within its retention window. Rejects new
    /// work once draining has begun.
    pub fn enqueue(&self, raw_sample_id: Uuid) -> Result<(), QueueError> {
        if self.inner.draining.load(Ordering::SeqCst) {
            return Err(QueueError::Draining);
        }
        if self.inner.dedup.contains_key(&raw_sample_id) {
            debug!(job_id = %raw_sample_id, "coalesced duplicate enqueue");
            return Ok(());
        }
        self.inner.dedup.insert(raw_sample_id, Record::InFlight);
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        // The receiver only drops once every sender (including this queue's
        // own retained clone inside `inner`) is gone, so this never fails.
        let _ = self.inner.tx.send(raw_sample_id);
        Ok(())
    }

    pub fn is_retained(&self, raw_sample_id: Uuid) -> bool {
        matches!(self.inner.dedup.get(&raw_sample_id).map(|r| *r), Some(Record::Retained { .. }))
    }

    pub fn is_in_flight(&self, raw_sample_id: Uuid) -> bool {
        matches!(self.inner.dedup.get(&raw_sample_id).map(|r| *r), Some(Record::InFlight))
    }

    /// Stop accepting new jobs and wait for every in-flight job to finish.
    pub async fn drain(&self) {
        self.inner.draining.store(true, Ordering::SeqCst);
        info!("job queue draining");

        // Register as a waiter before re-checking `in_flight`: `enable()` is
        // the documented way to avoid the lost-wakeup race where the last
        // job's `notify_waiters()` fires between our load and the first poll
        // of `notified()` (`notify_waiters` stores no permit for a waiter
        // that registers after it runs, so that call would otherwise be
        // lost and this future would await forever).
        let notified = self.inner.drained.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
            return;
        }
        notified.await;
    }
}

async fn dispatch_loop(inner: Arc<QueueInner>, mut rx: mpsc::UnboundedReceiver<Uuid>) {
    while let Some(job_id) = rx.recv().await {
        let inner = inner.clone();
        let permit = inner.semaphore.clone().acquire_owned().await.expect("semaphore never closed");
        tokio::spawn(async move {
            let _permit = permit;
            inner.rate_limiter.acquire().await;
            run_with_retry(&inner, job_id).await;

            if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1
                && inner.draining.load(Ordering::SeqCst)
            {
                inner.drained.notify_waiters();
            }
        });
    }
}

async fn run_with_retry(inner: &Arc<QueueInner>, job_id: Uuid) {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match inner.handler.handle(job_id).await {
            Ok(()) => {
                retain(inner, job_id, JobOutcome::Completed);
                return;
            }
            Err(failure) if failure.retriable && attempt < inner.config.max_attempts => {
                let delay = inner.config.retry_base * 2u32.pow(attempt - 1);
                warn!(job_id = %job_id, attempt, ?delay, error = %failure.message, "job failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(failure) => {
                warn!(job_id = %job_id, attempt, error = %failure.message, "job dead-lettered");
                retain(inner, job_id, JobOutcome::Failed);
                return;
            }
        }
    }
}

fn retain(inner: &Arc<QueueInner>, job_id: Uuid, outcome: JobOutcome) {
    let now = Instant::now();
    inner.dedup.insert(job_id, Record::Retained { outcome, at: now });

    let (order, limit, max_age) = match outcome {
        JobOutcome::Completed => (
            &inner.completed_order,
            inner.config.completed_retention,
            Some(inner.config.completed_retention_age),
        ),
        JobOutcome::Failed => (&inner.failed_order, inner.config.failed_retention, None),
    };

    let mut order = order.lock().unwrap();
    order.push_back(RetentionEntry { id: job_id, at: now });

    while order.len() > limit {
        let evicted = order.pop_front().unwrap();
        inner.dedup.remove(&evicted.id);
    }
    if let Some(max_age) = max_age {
        while let Some(front) = order.front() {
            if now.duration_since(front.at) > max_age {
                let evicted = order.pop_front().unwrap();
                inner.dedup.remove(&evicted.id);
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Mutex as AsyncMutex;

    struct CountingHandler {
        calls: AtomicU32,
        seen: AsyncMutex<Vec<Uuid>>,
        fail_first_n: u32,
        permanent: bool,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, raw_sample_id: Uuid) -> Result<(), JobFailure> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.seen.lock().await.push(raw_sample_id);
            if call <= self.fail_first_n {
                if self.permanent {
                    return Err(JobFailure::permanent("boom"));
                }
                return Err(JobFailure::retriable("boom"));
            }
            Ok(())
        }
    }

    fn fast_config() -> QueueConfig {
        QueueConfig {
            retry_base: Duration::from_millis(1),
            ..QueueConfig::default()
        }
    }

    #[tokio::test]
    async fn successful_job_is_retained_as_completed() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            seen: AsyncMutex::new(Vec::new()),
            fail_first_n: 0,
            permanent: false,
        });
        let queue = JobQueue::new(handler.clone(), fast_config());
        let id = Uuid::new_v4();
        queue.enqueue(id).unwrap();
        queue.drain().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(queue.is_retained(id));
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_coalesced() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            seen: AsyncMutex::new(Vec::new()),
            fail_first_n: 0,
            permanent: false,
        });
        let queue = JobQueue::new(handler.clone(), fast_config());
        let id = Uuid::new_v4();
        queue.enqueue(id).unwrap();
        queue.enqueue(id).unwrap();
        queue.drain().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retriable_failure_is_retried_up_to_max_attempts() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            seen: AsyncMutex::new(Vec::new()),
            fail_first_n: 2,
            permanent: false,
        });
        let queue = JobQueue::new(handler.clone(), fast_config());
        let id = Uuid::new_v4();
        queue.enqueue(id).unwrap();
        queue.drain().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(queue.is_retained(id));
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_the_job() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            seen: AsyncMutex::new(Vec::new()),
            fail_first_n: 10,
            permanent: false,
        });
        let queue = JobQueue::new(handler.clone(), fast_config());
        let id = Uuid::new_v4();
        queue.enqueue(id).unwrap();
        queue.drain().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(queue.is_retained(id));
    }

    #[tokio::test]
    async fn permanent_failure_skips_retry() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            seen: AsyncMutex::new(Vec::new()),
            fail_first_n: 10,
            permanent: true,
        });
        let queue = JobQueue::new(handler.clone(), fast_config());
        let id = Uuid::new_v4();
        queue.enqueue(id).unwrap();
        queue.drain().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn enqueue_after_drain_is_rejected() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            seen: AsyncMutex::new(Vec::new()),
            fail_first_n: 0,
            permanent: false,
        });
        let queue = JobQueue::new(handler, fast_config());
        queue.drain().await;

        let result = queue.enqueue(Uuid::new_v4());
        assert!(matches!(result, Err(QueueError::Draining)));
    }

    #[tokio::test]
    async fn distinct_devices_run_concurrently() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            seen: AsyncMutex::new(Vec::new()),
            fail_first_n: 0,
            permanent: false,
        });
        let queue = JobQueue::new(handler.clone(), fast_config());
        let ids: Vec<Uuid> = (0..20).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            queue.enqueue(*id).unwrap();
        }
        queue.drain().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), ids.len() as u32);
    }

    #[tokio::test]
    async fn reenqueueing_a_completed_job_id_produces_no_second_run() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            seen: AsyncMutex::new(Vec::new()),
            fail_first_n: 0,
            permanent: false,
        });
        let queue = JobQueue::new(handler.clone(), fast_config());
        let id = Uuid::new_v4();
        queue.enqueue(id).unwrap();

        for _ in 0..200 {
            if queue.is_retained(id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(queue.is_retained(id), "job should have completed and been retained");

        queue.enqueue(id).unwrap();
        queue.drain().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drain_completes_under_repeated_single_job_races() {
        // Regresses the lost-wakeup race between `drain()`'s in_flight check
        // and the last job's `notify_waiters()`: with exactly one in-flight
        // job, the decrement-and-notify in `dispatch_loop` can happen in the
        // same window `drain()` is about to start waiting on. Run it enough
        // times that a missing `enable()`-before-check would hang the test.
        for _ in 0..200 {
            let handler = Arc::new(CountingHandler {
                calls: AtomicU32::new(0),
                seen: AsyncMutex::new(Vec::new()),
                fail_first_n: 0,
                permanent: false,
            });
            let queue = JobQueue::new(handler.clone(), fast_config());
            queue.enqueue(Uuid::new_v4()).unwrap();
            tokio::time::timeout(Duration::from_secs(2), queue.drain())
                .await
                .expect("drain must not hang when the last job races the wait registration");
        }
    }
}
