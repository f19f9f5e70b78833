//! Admission: the transport-agnostic entry point for render requests.
//!
//! [`RenderService::handle`] normalizes a request, answers status queries,
//! gates submissions on the traffic quota, records the job, enqueues it and,
//! for synchronous callers, waits for its result with a timeout.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::WorkerConfig;
use crate::counters::{CounterError, CounterStore, PdfCounts, PdfCounters};
use crate::job::{JobHandle, JobRecord, JobState, RenderTask};
use crate::queue::{JobQueue, QueueError};
use crate::quota::{next_reset_date, QuotaGuard, TrafficStatus, DEFAULT_ESTIMATE_BYTES};
use crate::request::{Content, Normalized, RenderRequest, Submission, ValidationError};
use crate::sanitizer;
use crate::status::{StatusError, StatusMachine, StatusReply};
use crate::store::{JobStore, StoreError};
use crate::template::{self, TemplateStage};

/// Default ceiling on a synchronous wait (5 minutes).
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq)]
pub enum RenderResponse {
    Pdf(Vec<u8>),
    Status {
        pdfid: JobHandle,
        status: JobState,
        message: Option<String>,
    },
    Accepted {
        pdfid: JobHandle,
    },
}

impl RenderResponse {
    pub fn status_code(&self) -> u16 {
        200
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            RenderResponse::Pdf(_) => "application/pdf",
            _ => "application/json",
        }
    }

    /// JSON body, or `None` for a PDF.
    pub fn json(&self) -> Option<Value> {
        match self {
            RenderResponse::Pdf(_) => None,
            RenderResponse::Status {
                pdfid,
                status,
                message,
            } => {
                let mut body = json!({ "pdfid": pdfid, "status": status });
                if let Some(message) = message {
                    body["message"] = Value::String(message.clone());
                }
                Some(body)
            }
            RenderResponse::Accepted { pdfid } => Some(json!({ "pdfid": pdfid })),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            RenderResponse::Pdf(pdf) => pdf,
            other => other
                .json()
                .map(|body| body.to_string().into_bytes())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Monthly traffic limit reached. Service will resume next month.")]
    QuotaExceeded {
        usage_percent: f64,
        reset_date: NaiveDate,
    },

    #[error("{message}")]
    JobFailed { pdfid: JobHandle, message: String },

    #[error("pdfid invalid")]
    InvalidReference(JobHandle),

    #[error("Rendering timeout or error: {0}")]
    Timeout(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Counters(#[from] CounterError),
}

impl ServiceError {
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::Validation(_)
            | ServiceError::JobFailed { .. }
            | ServiceError::InvalidReference(_)
            | ServiceError::Timeout(_) => 400,
            ServiceError::QuotaExceeded { .. } => 503,
            ServiceError::Store(_) | ServiceError::Queue(_) | ServiceError::Counters(_) => 500,
        }
    }

    pub fn body(&self) -> Value {
        match self {
            ServiceError::QuotaExceeded {
                usage_percent,
                reset_date,
            } => json!({
                "error": "Service temporarily unavailable",
                "message": self.to_string(),
                "usage": format!("{usage_percent:.2}%"),
                "resetDate": reset_date.to_string(),
            }),
            ServiceError::JobFailed { pdfid, message } => json!({
                "pdfid": pdfid,
                "status": JobState::Error,
                "message": message,
            }),
            ServiceError::InvalidReference(pdfid) => json!({
                "pdfid": pdfid,
                "status": JobState::Error,
                "message": self.to_string(),
            }),
            _ => json!({ "message": self.to_string() }),
        }
    }
}

impl From<StatusError> for ServiceError {
    fn from(err: StatusError) -> Self {
        match err {
            StatusError::InvalidReference(handle) => ServiceError::InvalidReference(handle),
            StatusError::Store(err) => ServiceError::Store(err),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub store: String,
    pub queue: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub services: ServiceHealth,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }

    pub fn status_code(&self) -> u16 {
        if self.is_healthy() {
            200
        } else {
            503
        }
    }
}

pub struct RenderService {
    store: Arc<dyn JobStore>,
    queue: JobQueue,
    quota: QuotaGuard,
    pdf_counters: PdfCounters,
    status: StatusMachine,
    templates: TemplateStage,
    sync_timeout: Duration,
}

impl RenderService {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: JobQueue,
        quota: QuotaGuard,
        pdf_counters: PdfCounters,
    ) -> Self {
        Self {
            status: StatusMachine::new(store.clone()),
            store,
            queue,
            quota,
            pdf_counters,
            templates: TemplateStage::new(),
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
        }
    }

    /// Builds the service from worker configuration: the traffic ceiling
    /// and safety margin for the quota gate, and the synchronous wait.
    pub fn from_config(
        config: &WorkerConfig,
        store: Arc<dyn JobStore>,
        queue: JobQueue,
        counters: Arc<dyn CounterStore>,
    ) -> Self {
        let quota = QuotaGuard::new(
            counters.clone(),
            config.traffic_limit_bytes,
            config.traffic_safety_margin,
        );
        Self::new(store, queue, quota, PdfCounters::new(counters))
            .with_sync_timeout(config.sync_timeout)
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub async fn handle(&self, request: RenderRequest) -> Result<RenderResponse, ServiceError> {
        match request.normalize()? {
            Normalized::Status(handle) => self.query_status(&handle).await,
            Normalized::Submit(submission) => self.submit(submission).await,
        }
    }

    /// Parses a JSON body and handles it.
    pub async fn handle_json(&self, body: &[u8]) -> Result<RenderResponse, ServiceError> {
        self.handle(RenderRequest::from_json(body)?).await
    }

    pub async fn query_status(&self, handle: &JobHandle) -> Result<RenderResponse, ServiceError> {
        match self.status.query(handle).await? {
            StatusReply::Ready { pdf } => Ok(RenderResponse::Pdf(pdf)),
            StatusReply::Pending { state, message } => Ok(RenderResponse::Status {
                pdfid: handle.clone(),
                status: state,
                message: Some(message.to_string()),
            }),
            StatusReply::Failed { message } => Err(ServiceError::JobFailed {
                pdfid: handle.clone(),
                message,
            }),
        }
    }

    async fn submit(&self, submission: Submission) -> Result<RenderResponse, ServiceError> {
        if !self.quota.can_admit(DEFAULT_ESTIMATE_BYTES).await? {
            let usage_percent = self.quota.usage_percent().await?;
            warn!("Rejecting render request, traffic quota reached: usage={:.2}%", usage_percent);
            return Err(ServiceError::QuotaExceeded {
                usage_percent,
                reset_date: next_reset_date(Utc::now()),
            });
        }

        let html = match &submission.content {
            Content::Html(html) => html.clone(),
            Content::Markdown(markdown) => self.markdown_document(markdown, &submission.data)?,
        };

        let handle = JobHandle::generate();
        let assets_blob = submission.assets.as_ref().map(|a| a.as_bytes().to_vec());
        self.store
            .insert(JobRecord::open(handle.clone(), assets_blob))
            .await?;

        let mut task = RenderTask::new(handle.clone(), html, submission.engine);
        task.css = submission.css;
        task.javascript = submission.javascript;
        task.assets = submission.assets;
        task.data = submission.data;

        if let Err(err) = self.queue.submit(task).await {
            error!("Failed to enqueue job: job_id={}, error={}", handle, err);
            if let Err(err) = self.store.delete(&handle).await {
                warn!("Failed to remove unqueued job: job_id={}, error={}", handle, err);
            }
            return Err(err.into());
        }

        if !submission.sync {
            return Ok(RenderResponse::Accepted { pdfid: handle });
        }

        match self.queue.await_result(&handle, self.sync_timeout).await {
            Ok(_) => self.query_status(&handle).await,
            Err(err @ QueueError::Timeout(_)) => {
                info!("Synchronous wait timed out: job_id={}", handle);
                Err(ServiceError::Timeout(err.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Expands Markdown against the first data row, then converts it.
    fn markdown_document(
        &self,
        markdown: &str,
        rows: &[Value],
    ) -> Result<String, ValidationError> {
        let first = &rows[..rows.len().min(1)];
        let templated = self.templates.expand(markdown, first).map_err(|err| {
            error!("Failed to convert markdown to HTML: {}", err);
            ValidationError::Markdown
        })?;
        Ok(template::markdown_to_html(&sanitizer::clean(&templated)))
    }

    pub async fn health(&self) -> HealthReport {
        let store = match self.store.ping().await {
            Ok(()) => "ok".to_string(),
            Err(err) => format!("error: {err}"),
        };
        let queue = match self.queue.ping().await {
            Ok(()) => "ok".to_string(),
            Err(err) => format!("error: {err}"),
        };
        let healthy = store == "ok" && queue == "ok";

        HealthReport {
            status: if healthy { "healthy" } else { "unhealthy" },
            timestamp: Utc::now(),
            services: ServiceHealth { store, queue },
        }
    }

    pub async fn traffic_status(&self) -> Result<TrafficStatus, ServiceError> {
        Ok(self.quota.status().await?)
    }

    pub async fn pdf_counts(&self) -> Result<PdfCounts, ServiceError> {
        Ok(self.pdf_counters.snapshot().await?)
    }
}
