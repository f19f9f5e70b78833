//! PDF Render Worker Library
//!
//! Admission, queueing and worker pipeline for HTML/Markdown to PDF render
//! jobs. The HTTP layer lives elsewhere; it hands request bodies to
//! [`service::RenderService`] and maps the returned response or error to a
//! status code and body.
//!
//! ## Module Overview
//!
//! - `request`: request parsing and normalization
//! - `service`: admission, quota gating, sync waits, health
//! - `status`: status queries with single consumption of results
//! - `queue`: job queue with retry, intake limiting and result waits
//! - `worker`: worker pool draining the queue
//! - `pipeline`: per-task sanitize, compose, assets, template, render
//! - `sanitizer`, `composer`, `template`, `assets`, `renderer`: pipeline stages
//! - `store`: job records and their state transitions
//! - `quota`, `counters`: monthly traffic quota and PDF counts
//! - `maintenance`: counter resets and stale job cleanup
//! - `config`, `telemetry`: environment configuration and OpenTelemetry
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use worker_render::{
//!     counters::{MemoryCounters, PdfCounters},
//!     queue::{IntakeLimit, JobQueue, MemoryQueue, RetryPolicy},
//!     quota::QuotaGuard,
//!     service::RenderService,
//!     store::MemoryJobStore,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let counters = Arc::new(MemoryCounters::new());
//!     let queue = JobQueue::new(
//!         Arc::new(MemoryQueue::new()),
//!         RetryPolicy::default(),
//!         IntakeLimit::new(20, Duration::from_secs(60)),
//!     );
//!     let service = RenderService::new(
//!         Arc::new(MemoryJobStore::new()),
//!         queue,
//!         QuotaGuard::new(counters.clone(), 1 << 40, 0.95),
//!         PdfCounters::new(counters),
//!     );
//!
//!     let response = service
//!         .handle_json(br#"{"html": "<h1>Invoice</h1>", "sync": false}"#)
//!         .await;
//!     assert!(response.is_ok());
//! }
//! ```

pub mod assets;
pub mod composer;
pub mod config;
pub mod counters;
pub mod job;
pub mod maintenance;
pub mod pipeline;
pub mod queue;
pub mod quota;
pub mod renderer;
pub mod request;
pub mod sanitizer;
pub mod service;
pub mod status;
pub mod store;
pub mod telemetry;
pub mod template;
pub mod worker;
