use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;

use super::{IntakeLimit, QueueBackend, QueueError, QueueMetrics};
use crate::job::{JobHandle, RenderTask, TaskOutcome};

#[derive(Debug, Default)]
struct Lanes {
    ready: VecDeque<RenderTask>,
    delayed: Vec<(Instant, RenderTask)>,
    /// Claim times inside the current intake window, oldest first.
    intake: VecDeque<Instant>,
}

impl Lanes {
    fn promote_due(&mut self, now: Instant) {
        let mut index = 0;
        while index < self.delayed.len() {
            if self.delayed[index].0 <= now {
                let (_, task) = self.delayed.remove(index);
                self.ready.push_back(task);
            } else {
                index += 1;
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(due, _)| *due).min()
    }

    /// When the next intake slot frees up, or `None` if one is free now.
    fn intake_blocked_until(&mut self, now: Instant, limit: IntakeLimit) -> Option<Instant> {
        while self
            .intake
            .front()
            .is_some_and(|at| now.duration_since(*at) >= limit.window)
        {
            self.intake.pop_front();
        }
        if self.intake.len() < limit.max {
            return None;
        }
        self.intake.front().map(|oldest| *oldest + limit.window)
    }
}

/// In-process queue backend.
///
/// Outcomes live in one `watch` channel per handle, so a waiter that
/// subscribes after the outcome was stored still sees it.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    lanes: Mutex<Lanes>,
    ready: Notify,
    outcomes: DashMap<JobHandle, watch::Sender<Option<TaskOutcome>>>,
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn outcome_channel(&self, handle: &JobHandle) -> watch::Receiver<Option<TaskOutcome>> {
        self.outcomes
            .entry(handle.clone())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    fn leave_active(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn push(&self, task: &RenderTask) -> Result<(), QueueError> {
        self.lanes.lock().await.ready.push_back(task.clone());
        self.ready.notify_waiters();
        Ok(())
    }

    async fn pop(
        &self,
        timeout: Duration,
        intake: IntakeLimit,
    ) -> Result<Option<RenderTask>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.ready.notified();
            let wake_at = {
                let mut lanes = self.lanes.lock().await;
                let now = Instant::now();
                lanes.promote_due(now);
                let blocked_until = lanes.intake_blocked_until(now, intake);
                if blocked_until.is_none() {
                    if let Some(task) = lanes.ready.pop_front() {
                        lanes.intake.push_back(now);
                        self.active.fetch_add(1, Ordering::SeqCst);
                        return Ok(Some(task));
                    }
                }
                let mut wake_at = lanes
                    .next_due()
                    .map_or(deadline, |due| due.min(deadline));
                if let Some(free_at) = blocked_until {
                    wake_at = wake_at.min(free_at);
                }
                wake_at
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn retry(&self, task: &RenderTask, delay: Duration) -> Result<(), QueueError> {
        self.lanes
            .lock()
            .await
            .delayed
            .push((Instant::now() + delay, task.clone()));
        self.leave_active();
        self.ready.notify_waiters();
        Ok(())
    }

    async fn release(&self, _handle: &JobHandle) -> Result<(), QueueError> {
        self.leave_active();
        Ok(())
    }

    async fn finish(&self, handle: &JobHandle, outcome: &TaskOutcome) -> Result<(), QueueError> {
        if outcome.is_success() {
            self.completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        self.leave_active();

        self.outcomes
            .entry(handle.clone())
            .or_insert_with(|| watch::channel(None).0)
            .send_replace(Some(outcome.clone()));
        Ok(())
    }

    async fn outcome(&self, handle: &JobHandle) -> Result<Option<TaskOutcome>, QueueError> {
        Ok(self
            .outcomes
            .get(handle)
            .and_then(|sender| sender.borrow().clone()))
    }

    async fn wait_outcome(&self, handle: &JobHandle) -> Result<TaskOutcome, QueueError> {
        let mut rx = self.outcome_channel(handle);
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| QueueError::Closed(handle.clone()))?;
        outcome.clone().ok_or_else(|| QueueError::Closed(handle.clone()))
    }

    async fn metrics(&self) -> Result<QueueMetrics, QueueError> {
        let lanes = self.lanes.lock().await;
        Ok(QueueMetrics {
            waiting: (lanes.ready.len() + lanes.delayed.len()) as u64,
            active: self.active.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        })
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
