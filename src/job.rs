//! Job models and lifecycle state for the render queue.
//!
//! ```text
//!   admit ──→ open ──→ in_progress ──→ success
//!                           │
//!                           └────────→ error
//! ```
//!
//! Transitions only move forward. A retrying worker marking an
//! `in_progress` job `in_progress` again is a no-op, not a re-entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque caller-facing identifier for a job (`pdfid` on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    /// Generates a fresh random handle.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobHandle {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobHandle {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Open,
    InProgress,
    Success,
    Error,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Open => "open",
            JobState::InProgress => "in_progress",
            JobState::Success => "success",
            JobState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Error)
    }

    /// Whether a stored job in `self` may be moved to `next`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Open, JobState::InProgress)
                | (JobState::InProgress, JobState::InProgress)
                | (JobState::InProgress, JobState::Success)
                | (JobState::InProgress, JobState::Error)
        )
    }

    /// States a job may currently be in for a transition to `next` to apply.
    pub fn allowed_sources(next: JobState) -> &'static [JobState] {
        match next {
            JobState::Open => &[],
            JobState::InProgress => &[JobState::Open, JobState::InProgress],
            JobState::Success | JobState::Error => &[JobState::InProgress],
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(JobState::Open),
            "in_progress" => Ok(JobState::InProgress),
            "success" => Ok(JobState::Success),
            "error" => Ok(JobState::Error),
            other => Err(format!("unknown job state `{other}`")),
        }
    }
}

/// Rendering engine selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    WeasyPrint,
    PagedJs,
    Vivliostyle,
}

impl Engine {
    pub const ALL: [Engine; 3] = [Engine::WeasyPrint, Engine::PagedJs, Engine::Vivliostyle];

    pub fn name(&self) -> &'static str {
        match self {
            Engine::WeasyPrint => "weasyprint",
            Engine::PagedJs => "pagedjs",
            Engine::Vivliostyle => "vivliostyle",
        }
    }

    /// Whether the engine executes document JavaScript.
    pub fn supports_javascript(&self) -> bool {
        !matches!(self, Engine::WeasyPrint)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Engine::WeasyPrint
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Engine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Engine::ALL
            .into_iter()
            .find(|engine| engine.name() == s)
            .ok_or_else(|| format!("unknown renderer `{s}`"))
    }
}

/// Persisted job record, as held by the job store.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub handle: JobHandle,
    pub status: JobState,
    pub status_message: Option<String>,
    pub pdf: Option<Vec<u8>>,
    pub assets: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// A freshly admitted job.
    pub fn open(handle: JobHandle, assets: Option<Vec<u8>>) -> Self {
        let now = Utc::now();
        Self {
            handle,
            status: JobState::Open,
            status_message: None,
            pdf: None,
            assets,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_in_progress(&mut self) {
        self.status = JobState::InProgress;
        self.updated_at = Utc::now();
    }

    pub fn mark_success(&mut self, pdf: Vec<u8>) {
        self.status = JobState::Success;
        self.status_message = None;
        self.pdf = Some(pdf);
        self.assets = None;
        self.updated_at = Utc::now();
    }

    pub fn mark_error(&mut self, message: String) {
        self.status = JobState::Error;
        self.status_message = Some(message);
        self.pdf = None;
        self.updated_at = Utc::now();
    }
}

/// Work item carried by the queue from admission to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderTask {
    pub handle: JobHandle,
    pub html: String,
    #[serde(default)]
    pub css: String,
    #[serde(default)]
    pub javascript: String,
    pub engine: Engine,
    /// Base64 encoded zip bundle.
    #[serde(default)]
    pub assets: Option<String>,
    #[serde(default)]
    pub data: Vec<serde_json::Value>,
    /// 1-based attempt number of the next execution.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl RenderTask {
    pub fn new(handle: JobHandle, html: String, engine: Engine) -> Self {
        Self {
            handle,
            html,
            css: String::new(),
            javascript: String::new(),
            engine,
            assets: None,
            data: Vec::new(),
            attempt: 1,
            enqueued_at: Utc::now(),
        }
    }

    pub fn processing_duration_ms(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.enqueued_at)
            .num_milliseconds()
    }
}

/// Terminal result a worker reports for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded { pdf_bytes: usize },
    Failed { message: String },
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded { .. })
    }
}
