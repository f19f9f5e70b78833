//! Per-task processing: sanitize, compose, extract assets, template, render,
//! account and persist.

use base64::Engine as _;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::assets::{AssetBundle, AssetError, AssetVault};
use crate::composer;
use crate::counters::PdfCounters;
use crate::job::{JobHandle, JobState, RenderTask};
use crate::quota::QuotaGuard;
use crate::renderer::{RenderError, Renderer};
use crate::sanitizer;
use crate::store::{JobStore, StoreError};
use crate::template::{TemplateError, TemplateStage};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("asset extraction task failed: {0}")]
    Extraction(#[from] tokio::task::JoinError),
}

impl PipelineError {
    /// Whether another attempt could succeed.
    ///
    /// Bad input (assets, templates) fails the same way every time.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Render(_) | PipelineError::Extraction(_) => true,
            PipelineError::Store(err) => matches!(err, StoreError::Unavailable(_)),
            PipelineError::Asset(_) | PipelineError::Template(_) => false,
        }
    }
}

/// Result of executing one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    /// The PDF was rendered and stored; the job is `success`.
    Rendered { pdf_bytes: usize },
    /// The job was already terminal or no longer exists; nothing was done.
    Skipped { status: Option<JobState> },
}

pub struct RenderPipeline {
    store: Arc<dyn JobStore>,
    quota: QuotaGuard,
    pdf_counters: PdfCounters,
    vault: AssetVault,
    templates: TemplateStage,
    renderer: Arc<dyn Renderer>,
}

impl RenderPipeline {
    pub fn new(
        store: Arc<dyn JobStore>,
        quota: QuotaGuard,
        pdf_counters: PdfCounters,
        vault: AssetVault,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        Self {
            store,
            quota,
            pdf_counters,
            vault,
            templates: TemplateStage::new(),
            renderer,
        }
    }

    pub async fn execute(&self, task: &RenderTask) -> Result<Execution, PipelineError> {
        let handle = &task.handle;

        match self.store.get(handle).await? {
            Some(record) if record.status.is_terminal() => {
                info!(
                    "Skipping job already finished: job_id={}, status={}",
                    handle, record.status
                );
                return Ok(Execution::Skipped {
                    status: Some(record.status),
                });
            }
            None => {
                warn!("Skipping job missing from store: job_id={}", handle);
                return Ok(Execution::Skipped { status: None });
            }
            Some(_) => {}
        }

        self.store.mark_in_progress(handle).await?;
        info!(
            "Processing job: job_id={}, engine={}, attempt={}",
            handle, task.engine, task.attempt
        );

        let inputs = sanitizer::clean_all(&task.html, &task.css, &task.javascript);
        let document = composer::compose(&inputs.html, &inputs.css, &inputs.javascript);

        let bundle = match &task.assets {
            Some(encoded) => Some(self.extract_assets(encoded, handle).await?),
            None => None,
        };

        let rendered = self.render_document(task, document, bundle.as_ref()).await;

        if let Some(bundle) = bundle {
            if let Err(err) = bundle.release().await {
                warn!("Failed to release assets: job_id={}, error={}", handle, err);
            }
        }

        let pdf = rendered?;
        let pdf_bytes = pdf.len();

        if let Err(err) = self.quota.record(pdf_bytes as u64).await {
            error!("Failed to record traffic: job_id={}, error={}", handle, err);
        }
        match self.pdf_counters.increment().await {
            Ok(counts) => debug!(
                "PDF counters: total={}, week={}, month={}",
                counts.total, counts.week, counts.month
            ),
            Err(err) => error!("Failed to update PDF counters: job_id={}, error={}", handle, err),
        }

        self.store.complete(handle, pdf).await?;
        Ok(Execution::Rendered { pdf_bytes })
    }

    /// Marks a job `error` once no further attempt will be made.
    pub async fn fail(&self, handle: &JobHandle, message: &str) -> Result<(), StoreError> {
        // A job can fail before a worker ever marked it.
        self.store.mark_in_progress(handle).await?;
        self.store.fail(handle, message).await
    }

    async fn extract_assets(
        &self,
        encoded: &str,
        handle: &JobHandle,
    ) -> Result<AssetBundle, PipelineError> {
        let zip_bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(AssetError::from)?;

        let vault = self.vault.clone();
        let handle = handle.clone();
        let bundle =
            tokio::task::spawn_blocking(move || vault.extract(&zip_bytes, &handle)).await??;
        Ok(bundle)
    }

    async fn render_document(
        &self,
        task: &RenderTask,
        document: String,
        bundle: Option<&AssetBundle>,
    ) -> Result<Vec<u8>, PipelineError> {
        let document = match bundle {
            Some(bundle) => self.vault.resolve(&document, bundle),
            None => document,
        };
        let html = self.templates.expand(&document, &task.data)?;
        Ok(self.renderer.render(&html, task.engine).await?)
    }
}
