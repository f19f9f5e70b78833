//! Render task queue.
//!
//! The queue carries [`RenderTask`]s from admission to the worker pool and
//! carries [`TaskOutcome`]s back to synchronous callers. Storage lives
//! behind [`QueueBackend`]; [`JobQueue`] adds the retry policy, the intake
//! rate ceiling and the bounded wait for a result.

mod memory;
mod redis_queue;

pub use self::memory::MemoryQueue;
pub use self::redis_queue::{RedisQueue, DEFAULT_CLAIM_VISIBILITY};

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::job::{JobHandle, RenderTask, TaskOutcome};

/// How long a single claim blocks on an empty or saturated queue.
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("no result within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("queue backend unavailable: {0}")]
    Backend(#[from] ::redis::RedisError),

    #[error("malformed queue entry: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("result channel closed for job {0}")]
    Closed(JobHandle),
}

/// Counts reported by the backend for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetrics {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Storage and signalling for queued tasks.
///
/// `pop` moves a task to the active set; it leaves the active set through
/// exactly one of `finish`, `retry` or `release`.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn push(&self, task: &RenderTask) -> Result<(), QueueError>;

    /// Blocks up to `timeout` for a ready task while fewer than
    /// `intake.max` tasks were claimed from this backend in the last
    /// `intake.window`. A successful pop counts against the window.
    async fn pop(
        &self,
        timeout: Duration,
        intake: IntakeLimit,
    ) -> Result<Option<RenderTask>, QueueError>;

    /// Schedules an active task to become ready again after `delay`.
    async fn retry(&self, task: &RenderTask, delay: Duration) -> Result<(), QueueError>;

    /// Drops an active task without an outcome.
    async fn release(&self, handle: &JobHandle) -> Result<(), QueueError>;

    /// Stores the terminal outcome of an active task and wakes its waiters.
    async fn finish(&self, handle: &JobHandle, outcome: &TaskOutcome) -> Result<(), QueueError>;

    async fn outcome(&self, handle: &JobHandle) -> Result<Option<TaskOutcome>, QueueError>;

    /// Resolves once an outcome for `handle` is stored.
    async fn wait_outcome(&self, handle: &JobHandle) -> Result<TaskOutcome, QueueError>;

    async fn metrics(&self) -> Result<QueueMetrics, QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;
}

/// Attempt budget and exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay after the failed `attempt` (1-based): `base × 2^(attempt−1)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Backoff before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&self, task: &RenderTask) -> Option<Duration> {
        (task.attempt < self.max_attempts).then(|| self.delay_for_attempt(task.attempt))
    }
}

/// Sliding-window ceiling on task claims.
///
/// The window is kept by the backend, so every worker and every process
/// sharing one backend draws from the same budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntakeLimit {
    pub max: usize,
    pub window: Duration,
}

impl IntakeLimit {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max: max.max(1),
            window,
        }
    }
}

impl Default for IntakeLimit {
    fn default() -> Self {
        Self::new(20, Duration::from_secs(60))
    }
}

/// Queue front-end shared by admission and the worker pool.
#[derive(Clone)]
pub struct JobQueue {
    backend: Arc<dyn QueueBackend>,
    retry: RetryPolicy,
    intake: IntakeLimit,
    claim_timeout: Duration,
}

impl JobQueue {
    pub fn new(backend: Arc<dyn QueueBackend>, retry: RetryPolicy, intake: IntakeLimit) -> Self {
        Self {
            backend,
            retry,
            intake,
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
        }
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub async fn submit(&self, task: RenderTask) -> Result<JobHandle, QueueError> {
        self.backend.push(&task).await?;
        info!(
            "Enqueued job: job_id={}, engine={}",
            task.handle, task.engine
        );
        Ok(task.handle)
    }

    /// Waits up to `timeout` for the outcome of `handle`.
    ///
    /// A timeout leaves the task untouched; the caller can poll later.
    pub async fn await_result(
        &self,
        handle: &JobHandle,
        timeout: Duration,
    ) -> Result<TaskOutcome, QueueError> {
        match tokio::time::timeout(timeout, self.backend.wait_outcome(handle)).await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Timeout(timeout)),
        }
    }

    /// Claims the next ready task, honouring the intake ceiling.
    ///
    /// Returns `None` after the claim timeout when nothing is ready or the
    /// ceiling is reached, so callers get a chance to observe shutdown.
    pub async fn claim(&self) -> Result<Option<RenderTask>, QueueError> {
        let task = self.backend.pop(self.claim_timeout, self.intake).await?;
        if let Some(task) = &task {
            debug!("Dequeued job: job_id={}, attempt={}", task.handle, task.attempt);
        }
        Ok(task)
    }

    pub async fn ack(&self, handle: &JobHandle, pdf_bytes: usize) -> Result<(), QueueError> {
        self.backend
            .finish(handle, &TaskOutcome::Succeeded { pdf_bytes })
            .await
    }

    pub async fn nack(&self, handle: &JobHandle, message: &str) -> Result<(), QueueError> {
        self.backend
            .finish(
                handle,
                &TaskOutcome::Failed {
                    message: message.to_string(),
                },
            )
            .await
    }

    /// Schedules the next attempt of `task` after `delay`.
    pub async fn requeue(&self, mut task: RenderTask, delay: Duration) -> Result<(), QueueError> {
        task.attempt += 1;
        self.backend.retry(&task, delay).await?;
        info!(
            "Job re-queued for retry: job_id={}, attempt={}, delay_ms={}",
            task.handle,
            task.attempt,
            delay.as_millis()
        );
        Ok(())
    }

    pub fn retry_delay(&self, task: &RenderTask) -> Option<Duration> {
        self.retry.next_delay(task)
    }

    /// Drops a claimed task that needs no processing.
    pub async fn release(&self, handle: &JobHandle) -> Result<(), QueueError> {
        self.backend.release(handle).await
    }

    pub async fn outcome(&self, handle: &JobHandle) -> Result<Option<TaskOutcome>, QueueError> {
        self.backend.outcome(handle).await
    }

    pub async fn metrics(&self) -> Result<QueueMetrics, QueueError> {
        self.backend.metrics().await
    }

    pub async fn ping(&self) -> Result<(), QueueError> {
        self.backend.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Engine;
    use tokio::time::Instant;

    fn queue() -> JobQueue {
        JobQueue::new(
            Arc::new(MemoryQueue::new()),
            RetryPolicy::default(),
            IntakeLimit::default(),
        )
        .with_claim_timeout(Duration::from_millis(50))
    }

    fn limited_queue(backend: Arc<MemoryQueue>, max: usize) -> JobQueue {
        JobQueue::new(
            backend,
            RetryPolicy::default(),
            IntakeLimit::new(max, Duration::from_secs(60)),
        )
        .with_claim_timeout(Duration::from_secs(1))
    }

    fn task(handle: &str) -> RenderTask {
        RenderTask::new(handle.into(), "<p>x</p>".to_string(), Engine::WeasyPrint)
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));

        let mut task = task("a");
        assert_eq!(policy.next_delay(&task), Some(Duration::from_secs(2)));
        task.attempt = 2;
        assert_eq!(policy.next_delay(&task), Some(Duration::from_secs(4)));
        task.attempt = 3;
        assert_eq!(policy.next_delay(&task), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_intake_ceiling_waits_for_window() {
        let queue = limited_queue(Arc::new(MemoryQueue::new()), 2);
        for handle in ["a", "b", "c"] {
            queue.submit(task(handle)).await.unwrap();
        }
        let start = Instant::now();

        assert!(queue.claim().await.unwrap().is_some());
        assert!(queue.claim().await.unwrap().is_some());
        assert!(queue.claim().await.unwrap().is_none());

        let third = loop {
            if let Some(task) = queue.claim().await.unwrap() {
                break task;
            }
        };
        assert_eq!(third.handle.as_str(), "c");
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_intake_ceiling_is_shared_between_queues() {
        let backend = Arc::new(MemoryQueue::new());
        let first = limited_queue(backend.clone(), 2);
        let second = limited_queue(backend, 2);
        for handle in ["a", "b", "c", "d"] {
            first.submit(task(handle)).await.unwrap();
        }

        assert!(first.claim().await.unwrap().is_some());
        assert!(second.claim().await.unwrap().is_some());
        assert!(first.claim().await.unwrap().is_none());
        assert!(second.claim().await.unwrap().is_none());
        assert_eq!(first.metrics().await.unwrap().active, 2);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(second.claim().await.unwrap().is_some());
        assert!(first.claim().await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_claim_returns_within_timeout() {
        let queue = limited_queue(Arc::new(MemoryQueue::new()), 1);
        queue.submit(task("a")).await.unwrap();
        queue.submit(task("b")).await.unwrap();
        assert!(queue.claim().await.unwrap().is_some());

        let start = Instant::now();
        assert!(queue.claim().await.unwrap().is_none());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_claims_do_not_count() {
        let queue = limited_queue(Arc::new(MemoryQueue::new()), 1);

        assert!(queue.claim().await.unwrap().is_none());
        assert!(queue.claim().await.unwrap().is_none());

        queue.submit(task("a")).await.unwrap();
        let start = Instant::now();
        assert!(queue.claim().await.unwrap().is_some());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_claim_ack_wakes_waiter() {
        let queue = queue();
        let handle = queue.submit(task("job-1")).await.unwrap();

        let waiter = {
            let queue = queue.clone();
            let handle = handle.clone();
            tokio::spawn(async move { queue.await_result(&handle, Duration::from_secs(5)).await })
        };

        let claimed = queue.claim().await.unwrap().unwrap();
        assert_eq!(claimed.handle, handle);
        queue.ack(&handle, 1234).await.unwrap();

        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(outcome, TaskOutcome::Succeeded { pdf_bytes: 1234 });

        let metrics = queue.metrics().await.unwrap();
        assert_eq!(metrics.active, 0);
        assert_eq!(metrics.completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_result_times_out_without_cancelling() {
        let queue = queue();
        let handle = queue.submit(task("job-2")).await.unwrap();

        let err = queue
            .await_result(&handle, Duration::from_secs(300))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Timeout(_)));
        assert_eq!(err.to_string(), "no result within 300s");

        let claimed = queue.claim().await.unwrap();
        assert!(claimed.is_some());
        queue.nack(&handle, "engine crashed").await.unwrap();
        assert_eq!(
            queue.outcome(&handle).await.unwrap(),
            Some(TaskOutcome::Failed {
                message: "engine crashed".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_delays_next_attempt() {
        let queue = queue();
        queue.submit(task("job-3")).await.unwrap();
        let first = queue.claim().await.unwrap().unwrap();

        let delay = queue.retry_delay(&first).unwrap();
        queue.requeue(first, delay).await.unwrap();

        let start = Instant::now();
        let second = loop {
            if let Some(task) = queue.claim().await.unwrap() {
                break task;
            }
        };
        assert_eq!(second.attempt, 2);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
