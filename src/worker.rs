//! Fixed-size pool of workers draining the render queue.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::job::{RenderTask, TaskOutcome};
use crate::pipeline::{Execution, RenderPipeline};
use crate::queue::JobQueue;
use crate::telemetry;

/// Pause after a failed claim before the worker tries again.
const CLAIM_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// What a worker did with one claimed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Completed { pdf_bytes: usize },
    Retrying { attempt: u32, delay: Duration },
    Failed { message: String },
    Skipped,
}

pub struct WorkerPool {
    queue: JobQueue,
    pipeline: Arc<RenderPipeline>,
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(queue: JobQueue, pipeline: Arc<RenderPipeline>, concurrency: usize) -> Self {
        Self {
            queue,
            pipeline,
            concurrency: concurrency.max(1),
        }
    }

    /// Runs the workers until `shutdown` is cancelled and every worker has
    /// finished the task it was processing.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut workers = JoinSet::new();
        for worker_id in 0..self.concurrency {
            let queue = self.queue.clone();
            let pipeline = self.pipeline.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move { worker_loop(worker_id, queue, pipeline, shutdown).await });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!("Worker task panicked: {}", err);
            }
        }
        info!("All workers stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: JobQueue,
    pipeline: Arc<RenderPipeline>,
    shutdown: CancellationToken,
) {
    info!("Worker {} started", worker_id);

    while !shutdown.is_cancelled() {
        let task = match queue.claim().await {
            Ok(Some(task)) => task,
            Ok(None) => continue,
            Err(e) => {
                error!("Worker {} failed to claim job: {}", worker_id, e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(CLAIM_ERROR_BACKOFF) => continue,
                }
            }
        };

        process_task(&queue, &pipeline, task).await;
    }

    info!("Worker {} stopped", worker_id);
}

/// Executes one claimed task and settles it with the queue.
///
/// On success the job store is updated before the queue is acked, so a
/// synchronous caller woken by the ack always finds the terminal job.
pub async fn process_task(
    queue: &JobQueue,
    pipeline: &RenderPipeline,
    task: RenderTask,
) -> Disposition {
    let handle = task.handle.clone();

    let error = match pipeline.execute(&task).await {
        Ok(Execution::Rendered { pdf_bytes }) => {
            if let Err(e) = queue.ack(&handle, pdf_bytes).await {
                error!("Failed to ack job: job_id={}, error={}", handle, e);
            }
            telemetry::record_job_telemetry(&task, &TaskOutcome::Succeeded { pdf_bytes });
            return Disposition::Completed { pdf_bytes };
        }
        Ok(Execution::Skipped { .. }) => {
            if let Err(e) = queue.release(&handle).await {
                error!("Failed to release job: job_id={}, error={}", handle, e);
            }
            return Disposition::Skipped;
        }
        Err(e) => e,
    };

    let message = error.to_string();
    if error.is_retryable() {
        if let Some(delay) = queue.retry_delay(&task) {
            warn!(
                "Job attempt failed, retrying: job_id={}, attempt={}, error={}",
                handle, task.attempt, message
            );
            let attempt = task.attempt + 1;
            match queue.requeue(task.clone(), delay).await {
                Ok(()) => return Disposition::Retrying { attempt, delay },
                Err(e) => error!("Failed to requeue job: job_id={}, error={}", handle, e),
            }
        }
    }

    error!(
        "Job failed permanently: job_id={}, attempt={}, error={}",
        handle, task.attempt, message
    );
    if let Err(e) = pipeline.fail(&handle, &message).await {
        error!("Failed to mark job failed: job_id={}, error={}", handle, e);
    }
    if let Err(e) = queue.nack(&handle, &message).await {
        error!("Failed to nack job: job_id={}, error={}", handle, e);
    }
    telemetry::record_job_telemetry(
        &task,
        &TaskOutcome::Failed {
            message: message.clone(),
        },
    );
    Disposition::Failed { message }
}
