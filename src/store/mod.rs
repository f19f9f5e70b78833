//! Persistent job store.
//!
//! Every state transition is applied as one atomic store operation, so a
//! concurrent reader never observes PDF bytes on a job whose status is not
//! yet `success`. [`JobStore::consume`] is the only way a terminal result
//! leaves the store: it returns and deletes the job in one step.

mod memory;
mod redis_store;

pub use self::memory::MemoryJobStore;
pub use self::redis_store::RedisJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::job::{JobHandle, JobRecord, JobState};

/// How long an uncollected successful job is kept, in hours.
pub const SUCCESS_RETENTION_HOURS: i64 = 2;

/// How long an uncollected failed job is kept, in hours.
pub const ERROR_RETENTION_HOURS: i64 = 24;

/// Ceiling on how long a job may sit open or in progress, in hours. A job
/// this old lost its task and will never reach a terminal state.
pub const PENDING_RETENTION_HOURS: i64 = 48;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(JobHandle),

    #[error("job {handle} cannot move from {from} to {to}")]
    InvalidTransition {
        handle: JobHandle,
        from: JobState,
        to: JobState,
    },

    #[error("job {handle} has a corrupt record: {reason}")]
    Corrupt { handle: JobHandle, reason: String },

    #[error("job store unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError>;

    async fn get(&self, handle: &JobHandle) -> Result<Option<JobRecord>, StoreError>;

    /// `open | in_progress → in_progress`.
    async fn mark_in_progress(&self, handle: &JobHandle) -> Result<(), StoreError>;

    /// `in_progress → success`, storing the PDF and dropping the asset blob.
    async fn complete(&self, handle: &JobHandle, pdf: Vec<u8>) -> Result<(), StoreError>;

    /// `in_progress → error`, storing the message.
    async fn fail(&self, handle: &JobHandle, message: &str) -> Result<(), StoreError>;

    /// Returns the job, deleting it in the same step when it is terminal.
    async fn consume(&self, handle: &JobHandle) -> Result<Option<JobRecord>, StoreError>;

    async fn delete(&self, handle: &JobHandle) -> Result<bool, StoreError>;

    /// Removes jobs older than their retention window.
    async fn purge_stale(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Whether an uncollected job is past its retention window at `now`.
pub fn is_stale(record: &JobRecord, now: DateTime<Utc>) -> bool {
    let age = now.signed_duration_since(record.updated_at);
    match record.status {
        JobState::Success => age > Duration::hours(SUCCESS_RETENTION_HOURS),
        JobState::Error => age > Duration::hours(ERROR_RETENTION_HOURS),
        JobState::Open | JobState::InProgress => age > Duration::hours(PENDING_RETENTION_HOURS),
    }
}
