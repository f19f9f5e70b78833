//! Status queries by job handle.

use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::job::{JobHandle, JobState};
use crate::store::{JobStore, StoreError};

/// Message reported for a failed job that carries none.
pub const UNKNOWN_FAILURE_MESSAGE: &str = "Could not render PDF due to unknown error";

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("pdfid invalid")]
    InvalidReference(JobHandle),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusReply {
    Pending { state: JobState, message: &'static str },
    Ready { pdf: Vec<u8> },
    Failed { message: String },
}

#[derive(Clone)]
pub struct StatusMachine {
    store: Arc<dyn JobStore>,
}

impl StatusMachine {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Reports the job's state. A terminal result is handed out once and
    /// the job is deleted in the same store operation.
    pub async fn query(&self, handle: &JobHandle) -> Result<StatusReply, StatusError> {
        let record = self
            .store
            .consume(handle)
            .await?
            .ok_or_else(|| StatusError::InvalidReference(handle.clone()))?;

        debug!("Status query: job_id={}, status={}", handle, record.status);
        let reply = match record.status {
            JobState::Open => StatusReply::Pending {
                state: JobState::Open,
                message: "PDF rendering has not started yet",
            },
            JobState::InProgress => StatusReply::Pending {
                state: JobState::InProgress,
                message: "PDF rendering is currently in progress",
            },
            JobState::Success => match record.pdf {
                Some(pdf) => StatusReply::Ready { pdf },
                None => StatusReply::Failed {
                    message: "No PDF produced".to_string(),
                },
            },
            JobState::Error => StatusReply::Failed {
                message: record
                    .status_message
                    .unwrap_or_else(|| UNKNOWN_FAILURE_MESSAGE.to_string()),
            },
        };
        Ok(reply)
    }
}
