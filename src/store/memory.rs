use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{is_stale, JobStore, StoreError};
use crate::job::{JobHandle, JobRecord, JobState};

/// In-process job store. Each operation runs under a single lock, which
/// makes every transition and every consume atomic.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<JobHandle, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    async fn transition<F>(&self, handle: &JobHandle, next: JobState, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut JobRecord) + Send,
    {
        let mut jobs = self.jobs.lock().await;
        let record = jobs
            .get_mut(handle)
            .ok_or_else(|| StoreError::NotFound(handle.clone()))?;

        if !record.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                handle: handle.clone(),
                from: record.status,
                to: next,
            });
        }

        apply(record);
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError> {
        self.jobs.lock().await.insert(record.handle.clone(), record);
        Ok(())
    }

    async fn get(&self, handle: &JobHandle) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.jobs.lock().await.get(handle).cloned())
    }

    async fn mark_in_progress(&self, handle: &JobHandle) -> Result<(), StoreError> {
        self.transition(handle, JobState::InProgress, |record| record.mark_in_progress())
            .await
    }

    async fn complete(&self, handle: &JobHandle, pdf: Vec<u8>) -> Result<(), StoreError> {
        self.transition(handle, JobState::Success, move |record| record.mark_success(pdf))
            .await
    }

    async fn fail(&self, handle: &JobHandle, message: &str) -> Result<(), StoreError> {
        let message = message.to_string();
        self.transition(handle, JobState::Error, move |record| record.mark_error(message))
            .await
    }

    async fn consume(&self, handle: &JobHandle) -> Result<Option<JobRecord>, StoreError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get(handle).map(|record| record.status) {
            Some(status) if status.is_terminal() => Ok(jobs.remove(handle)),
            Some(_) => Ok(jobs.get(handle).cloned()),
            None => Ok(None),
        }
    }

    async fn delete(&self, handle: &JobHandle) -> Result<bool, StoreError> {
        Ok(self.jobs.lock().await.remove(handle).is_some())
    }

    async fn purge_stale(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, record| !is_stale(record, now));
        Ok(before - jobs.len())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
