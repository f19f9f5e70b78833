//! Redis-based render queue.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{IntakeLimit, QueueBackend, QueueError, QueueMetrics};
use crate::job::{JobHandle, RenderTask, TaskOutcome};

/// List of tasks ready to be claimed.
const PENDING_KEY: &str = "render:queue:pending";

/// Sorted set of tasks waiting for their retry backoff, scored by ready time (ms).
const DELAYED_KEY: &str = "render:queue:delayed";

/// Sorted set of claimed handles, scored by visibility deadline (ms).
const CLAIMS_KEY: &str = "render:queue:claims";

/// Hash of claimed handle to task JSON, used to re-queue expired claims.
const CLAIMED_KEY: &str = "render:queue:claimed";

/// Sorted set of recent claims, scored by claim time (ms).
const INTAKE_KEY: &str = "render:queue:intake";

/// Outcome key prefix, one key per job.
const RESULT_KEY_PREFIX: &str = "render:queue:result";

const ACTIVE_KEY: &str = "render:queue:active";
const COMPLETED_KEY: &str = "render:queue:completed";
const FAILED_KEY: &str = "render:queue:failed";

/// Outcome TTL in seconds (24 hours).
const RESULT_TTL_SECONDS: u64 = 86400;

/// How long a claimed task stays invisible before it is handed out again.
pub const DEFAULT_CLAIM_VISIBILITY: Duration = Duration::from_secs(10 * 60);

/// How often a synchronous waiter re-reads the outcome key.
const OUTCOME_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long a claim sleeps between attempts on an empty queue.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Claims one task.
///
/// KEYS: delayed, pending, claims, claimed, active, intake.
/// ARGV: now (ms), visibility deadline (ms), intake window (ms), intake max,
/// intake member.
/// Returns `{'task', json}`, `{'wait', ms}` when the intake window is full,
/// or `{'empty', ''}`.
const CLAIM_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now)
for _, item in ipairs(due) do
  redis.call('ZREM', KEYS[1], item)
  redis.call('RPUSH', KEYS[2], item)
end
local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', now)
for _, handle in ipairs(expired) do
  local item = redis.call('HGET', KEYS[4], handle)
  redis.call('ZREM', KEYS[3], handle)
  redis.call('HDEL', KEYS[4], handle)
  redis.call('DECR', KEYS[5])
  if item then redis.call('LPUSH', KEYS[2], item) end
end
if redis.call('LLEN', KEYS[2]) == 0 then return {'empty', ''} end
local window = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[6], '-inf', now - window)
if redis.call('ZCARD', KEYS[6]) >= tonumber(ARGV[4]) then
  local oldest = redis.call('ZRANGE', KEYS[6], 0, 0, 'WITHSCORES')
  return {'wait', tostring(tonumber(oldest[2]) + window - now)}
end
local item = redis.call('LPOP', KEYS[2])
local handle = cjson.decode(item)['handle']
redis.call('ZADD', KEYS[6], now, ARGV[5])
redis.call('PEXPIRE', KEYS[6], window)
redis.call('ZADD', KEYS[3], ARGV[2], handle)
redis.call('HSET', KEYS[4], handle, item)
redis.call('INCR', KEYS[5])
return {'task', item}
"#;

/// Drops the claim on ARGV[1]. Returns 1 when the claim was still held.
///
/// KEYS: claims, claimed, active.
const SETTLE_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then return 0 end
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('DECR', KEYS[3])
return 1
"#;

enum Claim {
    Task(RenderTask),
    Wait(Duration),
    Empty,
}

/// Redis queue backend.
///
/// Tasks are JSON in a Redis list. A claim moves the task into a
/// visibility set; a worker that dies mid-render leaves the claim to
/// expire, and the next claim puts the task back at the head of the queue.
/// The intake window lives in Redis so every worker process shares it.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    claim: Script,
    settle: Script,
    visibility: Duration,
}

impl RedisQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            claim: Script::new(CLAIM_SCRIPT),
            settle: Script::new(SETTLE_SCRIPT),
            visibility: DEFAULT_CLAIM_VISIBILITY,
        }
    }

    /// Sets how long a claim may run before the task is handed out again.
    /// Keep it above the longest render including engine timeouts.
    pub fn with_visibility(mut self, visibility: Duration) -> Self {
        self.visibility = visibility;
        self
    }

    fn result_key(handle: &JobHandle) -> String {
        format!("{}:{}", RESULT_KEY_PREFIX, handle)
    }

    /// Releases the claim on `handle`; false when it had already expired.
    async fn settle(&self, handle: &JobHandle) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let settled: i64 = self
            .settle
            .key(CLAIMS_KEY)
            .key(CLAIMED_KEY)
            .key(ACTIVE_KEY)
            .arg(handle.as_str())
            .invoke_async(&mut conn)
            .await?;
        if settled == 0 {
            warn!("Claim already expired: job_id={}", handle);
        }
        Ok(settled == 1)
    }

    async fn try_claim(&self, intake: IntakeLimit) -> Result<Claim, QueueError> {
        let mut conn = self.conn.clone();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let visible_at = now_ms + self.visibility.as_millis() as i64;
        let (kind, payload): (String, String) = self
            .claim
            .key(DELAYED_KEY)
            .key(PENDING_KEY)
            .key(CLAIMS_KEY)
            .key(CLAIMED_KEY)
            .key(ACTIVE_KEY)
            .key(INTAKE_KEY)
            .arg(now_ms)
            .arg(visible_at)
            .arg(intake.window.as_millis() as i64)
            .arg(intake.max)
            .arg(Uuid::new_v4().to_string())
            .invoke_async(&mut conn)
            .await?;

        match kind.as_str() {
            "task" => Ok(Claim::Task(serde_json::from_str(&payload)?)),
            "wait" => {
                let ms = payload.parse::<f64>().unwrap_or(0.0).max(1.0);
                Ok(Claim::Wait(Duration::from_millis(ms as u64)))
            }
            _ => Ok(Claim::Empty),
        }
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn push(&self, task: &RenderTask) -> Result<(), QueueError> {
        let task_json = serde_json::to_string(task)?;
        let mut conn = self.conn.clone();

        // RPUSH for FIFO order
        conn.rpush::<_, _, ()>(PENDING_KEY, &task_json).await?;
        Ok(())
    }

    async fn pop(
        &self,
        timeout: Duration,
        intake: IntakeLimit,
    ) -> Result<Option<RenderTask>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            let pause = match self.try_claim(intake).await? {
                Claim::Task(task) => return Ok(Some(task)),
                Claim::Wait(wait) => {
                    debug!("Intake ceiling reached, next slot in {}ms", wait.as_millis());
                    wait
                }
                Claim::Empty => CLAIM_POLL_INTERVAL,
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep_until((now + pause).min(deadline)).await;
        }
    }

    async fn retry(&self, task: &RenderTask, delay: Duration) -> Result<(), QueueError> {
        // An expired claim was already re-queued by another claim.
        if !self.settle(&task.handle).await? {
            return Ok(());
        }
        let task_json = serde_json::to_string(task)?;
        let ready_at = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;

        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(DELAYED_KEY, &task_json, ready_at)
            .await?;
        Ok(())
    }

    async fn release(&self, handle: &JobHandle) -> Result<(), QueueError> {
        self.settle(handle).await.map(|_| ())
    }

    async fn finish(&self, handle: &JobHandle, outcome: &TaskOutcome) -> Result<(), QueueError> {
        let outcome_json = serde_json::to_string(outcome)?;
        let counter = if outcome.is_success() {
            COMPLETED_KEY
        } else {
            FAILED_KEY
        };

        self.settle(handle).await?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .set_ex(Self::result_key(handle), &outcome_json, RESULT_TTL_SECONDS)
            .ignore()
            .incr(counter, 1)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn outcome(&self, handle: &JobHandle) -> Result<Option<TaskOutcome>, QueueError> {
        let mut conn = self.conn.clone();
        let outcome_json: Option<String> = conn.get(Self::result_key(handle)).await?;
        match outcome_json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn wait_outcome(&self, handle: &JobHandle) -> Result<TaskOutcome, QueueError> {
        loop {
            match self.outcome(handle).await {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => {}
                Err(QueueError::Backend(err)) => {
                    warn!("Failed to read job outcome: job_id={}, error={}", handle, err);
                }
                Err(err) => return Err(err),
            }
            tokio::time::sleep(OUTCOME_POLL_INTERVAL).await;
        }
    }

    async fn metrics(&self) -> Result<QueueMetrics, QueueError> {
        let mut conn = self.conn.clone();
        let (pending, delayed, active, completed, failed): (
            u64,
            u64,
            Option<i64>,
            Option<i64>,
            Option<i64>,
        ) = redis::pipe()
            .llen(PENDING_KEY)
            .zcard(DELAYED_KEY)
            .get(ACTIVE_KEY)
            .get(COMPLETED_KEY)
            .get(FAILED_KEY)
            .query_async(&mut conn)
            .await?;

        let count = |value: Option<i64>| value.unwrap_or(0).max(0) as u64;
        Ok(QueueMetrics {
            waiting: pending + delayed,
            active: count(active),
            completed: count(completed),
            failed: count(failed),
        })
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Engine;

    // Note: These tests require a running Redis instance.
    // Run with: docker run -d -p 6379:6379 redis:7-alpine
    // Skip in CI: cargo test --lib -- --skip redis_queue::tests

    async fn queue() -> RedisQueue {
        let client = redis::Client::open("redis://127.0.0.1/").unwrap();
        let conn = ConnectionManager::new(client).await.unwrap();
        RedisQueue::new(conn)
    }

    fn unlimited() -> IntakeLimit {
        IntakeLimit::new(10_000, Duration::from_secs(1))
    }

    #[tokio::test]
    #[ignore]
    async fn test_push_pop_finish() {
        let queue = queue().await;
        let task = RenderTask::new(JobHandle::generate(), "<p>x</p>".into(), Engine::PagedJs);

        queue.push(&task).await.unwrap();
        let popped = queue
            .pop(Duration::from_secs(1), unlimited())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped.handle, task.handle);
        assert_eq!(popped.engine, Engine::PagedJs);

        queue
            .finish(&task.handle, &TaskOutcome::Succeeded { pdf_bytes: 10 })
            .await
            .unwrap();
        let outcome = queue.wait_outcome(&task.handle).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Succeeded { pdf_bytes: 10 });
    }

    #[tokio::test]
    #[ignore]
    async fn test_retry_is_delayed() {
        let queue = queue().await;
        let task = RenderTask::new(JobHandle::generate(), String::new(), Engine::WeasyPrint);
        queue.push(&task).await.unwrap();
        let claimed = queue
            .pop(Duration::from_secs(1), unlimited())
            .await
            .unwrap()
            .unwrap();

        queue.retry(&claimed, Duration::from_millis(300)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let popped = queue
            .pop(Duration::from_secs(1), unlimited())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped.handle, task.handle);
        queue.release(&popped.handle).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_expired_claim_is_handed_out_again() {
        let queue = queue().await.with_visibility(Duration::from_millis(200));
        let task = RenderTask::new(JobHandle::generate(), String::new(), Engine::WeasyPrint);
        queue.push(&task).await.unwrap();

        let first = queue
            .pop(Duration::from_secs(1), unlimited())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.handle, task.handle);

        // The worker holding the claim never settles it.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let again = queue
            .pop(Duration::from_secs(1), unlimited())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.handle, task.handle);
        queue.release(&again.handle).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_intake_window_is_shared_between_connections() {
        let first = queue().await;
        let second = queue().await;
        let intake = IntakeLimit::new(1, Duration::from_secs(2));
        let mut conn = first.conn.clone();
        conn.del::<_, ()>(INTAKE_KEY).await.unwrap();

        for _ in 0..2 {
            let task = RenderTask::new(JobHandle::generate(), String::new(), Engine::WeasyPrint);
            first.push(&task).await.unwrap();
        }

        let claimed = first.pop(Duration::from_millis(200), intake).await.unwrap().unwrap();
        assert!(second
            .pop(Duration::from_millis(200), intake)
            .await
            .unwrap()
            .is_none());
        first.release(&claimed.handle).await.unwrap();

        let later = second.pop(Duration::from_secs(3), intake).await.unwrap().unwrap();
        second.release(&later.handle).await.unwrap();
    }
}
