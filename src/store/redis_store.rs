use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::{aio::ConnectionManager, AsyncCommands, Script, Value};
use std::collections::HashMap;
use tracing::debug;

use super::{
    JobStore, StoreError, ERROR_RETENTION_HOURS, PENDING_RETENTION_HOURS, SUCCESS_RETENTION_HOURS,
};
use crate::job::{JobHandle, JobRecord, JobState};

/// Key prefix for job hashes.
const JOB_KEY_PREFIX: &str = "render:job";

/// Moves a job to ARGV[1] if its current status is one of ARGV[6..].
///
/// ARGV: target status, updated_at, payload field (or ""), payload, ttl secs.
/// Returns 1 when applied, -1 when the job is missing, or the current status
/// when the transition is not allowed.
const TRANSITION_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'status')
if not current then return -1 end
local allowed = false
for i = 6, #ARGV do
  if ARGV[i] == current then allowed = true end
end
if not allowed then return current end
redis.call('HSET', KEYS[1], 'status', ARGV[1], 'updated_at', ARGV[2])
if ARGV[3] ~= '' then redis.call('HSET', KEYS[1], ARGV[3], ARGV[4]) end
if ARGV[1] == 'success' then redis.call('HDEL', KEYS[1], 'assets', 'status_message') end
if ARGV[1] == 'error' then redis.call('HDEL', KEYS[1], 'pdf') end
if tonumber(ARGV[5]) > 0 then redis.call('EXPIRE', KEYS[1], ARGV[5]) end
return 1
"#;

/// Returns all fields of a job and deletes it when terminal.
const CONSUME_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then return nil end
local fields = redis.call('HGETALL', KEYS[1])
if status == 'success' or status == 'error' then redis.call('DEL', KEYS[1]) end
return fields
"#;

/// Redis-backed job store. Each job is one hash carrying a TTL: a long
/// safety TTL while open or in progress, replaced by the retention window
/// on the terminal transition.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: ConnectionManager,
    transition: Script,
    consume: Script,
}

impl RedisJobStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            transition: Script::new(TRANSITION_SCRIPT),
            consume: Script::new(CONSUME_SCRIPT),
        }
    }

    fn key(handle: &JobHandle) -> String {
        format!("{}:{}", JOB_KEY_PREFIX, handle)
    }

    async fn apply(
        &self,
        handle: &JobHandle,
        next: JobState,
        payload: Option<(&str, &[u8])>,
        ttl_secs: i64,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let (field, value) = payload.unwrap_or(("", b""));

        let mut invocation = self.transition.key(Self::key(handle));
        invocation
            .arg(next.as_str())
            .arg(Utc::now().to_rfc3339())
            .arg(field)
            .arg(value)
            .arg(ttl_secs);
        for source in JobState::allowed_sources(next) {
            invocation.arg(source.as_str());
        }

        let result: Value = invocation.invoke_async(&mut conn).await?;
        match result {
            Value::Int(1) => {
                debug!("Updated job status: job_id={}, status={}", handle, next);
                Ok(())
            }
            Value::Int(_) => Err(StoreError::NotFound(handle.clone())),
            Value::Data(current) => {
                let from = parse_state(handle, &current)?;
                Err(StoreError::InvalidTransition {
                    handle: handle.clone(),
                    from,
                    to: next,
                })
            }
            other => Err(StoreError::Corrupt {
                handle: handle.clone(),
                reason: format!("unexpected transition reply {other:?}"),
            }),
        }
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut fields: Vec<(&str, Vec<u8>)> = vec![
            ("status", record.status.as_str().as_bytes().to_vec()),
            ("created_at", record.created_at.to_rfc3339().into_bytes()),
            ("updated_at", record.updated_at.to_rfc3339().into_bytes()),
        ];
        if let Some(assets) = record.assets {
            fields.push(("assets", assets));
        }

        let key = Self::key(&record.handle);
        redis::pipe()
            .atomic()
            .hset_multiple(&key, &fields)
            .ignore()
            .expire(&key, pending_ttl())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, handle: &JobHandle) -> Result<Option<JobRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, Vec<u8>> = conn.hgetall(Self::key(handle)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        parse_record(handle, fields).map(Some)
    }

    async fn mark_in_progress(&self, handle: &JobHandle) -> Result<(), StoreError> {
        self.apply(handle, JobState::InProgress, None, pending_ttl())
            .await
    }

    async fn complete(&self, handle: &JobHandle, pdf: Vec<u8>) -> Result<(), StoreError> {
        let ttl = Duration::hours(SUCCESS_RETENTION_HOURS).num_seconds();
        self.apply(handle, JobState::Success, Some(("pdf", &pdf)), ttl)
            .await
    }

    async fn fail(&self, handle: &JobHandle, message: &str) -> Result<(), StoreError> {
        let ttl = Duration::hours(ERROR_RETENTION_HOURS).num_seconds();
        self.apply(
            handle,
            JobState::Error,
            Some(("status_message", message.as_bytes())),
            ttl,
        )
        .await
    }

    async fn consume(&self, handle: &JobHandle) -> Result<Option<JobRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: Option<HashMap<String, Vec<u8>>> = self
            .consume
            .key(Self::key(handle))
            .invoke_async(&mut conn)
            .await?;

        match fields {
            Some(fields) if !fields.is_empty() => parse_record(handle, fields).map(Some),
            _ => Ok(None),
        }
    }

    async fn delete(&self, handle: &JobHandle) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(Self::key(handle)).await?;
        Ok(removed > 0)
    }

    async fn purge_stale(&self, _now: DateTime<Utc>) -> Result<usize, StoreError> {
        // Every job key carries a TTL matching its retention window.
        Ok(0)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}

fn pending_ttl() -> i64 {
    Duration::hours(PENDING_RETENTION_HOURS).num_seconds()
}

fn parse_state(handle: &JobHandle, raw: &[u8]) -> Result<JobState, StoreError> {
    std::str::from_utf8(raw)
        .map_err(|err| err.to_string())
        .and_then(|s| s.parse())
        .map_err(|reason| StoreError::Corrupt {
            handle: handle.clone(),
            reason,
        })
}

fn parse_time(handle: &JobHandle, raw: Option<&Vec<u8>>) -> Result<DateTime<Utc>, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        handle: handle.clone(),
        reason,
    };
    let raw = raw.ok_or_else(|| corrupt("missing timestamp".to_string()))?;
    let text = std::str::from_utf8(raw).map_err(|err| corrupt(err.to_string()))?;
    DateTime::parse_from_rfc3339(text)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|err| corrupt(err.to_string()))
}

fn parse_record(
    handle: &JobHandle,
    mut fields: HashMap<String, Vec<u8>>,
) -> Result<JobRecord, StoreError> {
    let status = match fields.get("status") {
        Some(raw) => parse_state(handle, raw)?,
        None => {
            return Err(StoreError::Corrupt {
                handle: handle.clone(),
                reason: "missing status".to_string(),
            })
        }
    };
    let created_at = parse_time(handle, fields.get("created_at"))?;
    let updated_at = parse_time(handle, fields.get("updated_at"))?;
    let status_message = fields
        .remove("status_message")
        .map(|raw| String::from_utf8_lossy(&raw).into_owned());

    Ok(JobRecord {
        handle: handle.clone(),
        status,
        status_message,
        pdf: fields.remove("pdf"),
        assets: fields.remove("assets"),
        created_at,
        updated_at,
    })
}
