//! PDF Render Worker Service
//!
//! Consumes render jobs from a Redis queue and turns them into PDFs with
//! weasyprint, pagedjs or vivliostyle.
//!
//! ## Architecture
//!
//! - **Queue**: Redis list `render:queue:pending`, delayed retries in `render:queue:delayed`,
//!   claims in `render:queue:claims`, shared intake window in `render:queue:intake`
//! - **Jobs**: Redis hashes `render:job:{pdfid}`
//! - **Counters**: `monthly:traffic:bytes`, `pdf:total`, `pdf:week`, `pdf:month`
//! - **Telemetry**: OpenTelemetry OTLP export
//!
//! See [`worker_render::config`] for the environment variables.

use anyhow::{Context, Result};
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use worker_render::assets::AssetVault;
use worker_render::config::{LogFormat, WorkerConfig};
use worker_render::counters::{PdfCounters, RedisCounters};
use worker_render::maintenance::Janitor;
use worker_render::pipeline::RenderPipeline;
use worker_render::queue::{JobQueue, RedisQueue};
use worker_render::quota::QuotaGuard;
use worker_render::renderer::CommandRenderer;
use worker_render::store::RedisJobStore;
use worker_render::telemetry;
use worker_render::worker::WorkerPool;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const JANITOR_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    if let Err(e) = telemetry::init_telemetry(&config.otel_endpoint, &config.otel_service_name) {
        warn!("Failed to initialize telemetry: {}", e);
    }

    info!("Starting PDF render worker service");
    info!(
        "Configuration: redis_url={}, concurrency={}, asset_root={}",
        config.redis_url,
        config.concurrency,
        config.asset_root.display()
    );

    let client = Client::open(config.redis_url.as_str()).context("Failed to create Redis client")?;
    let conn = ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;

    info!("Connected to Redis");

    let store = Arc::new(RedisJobStore::new(conn.clone()));
    let counters = Arc::new(RedisCounters::new(conn.clone()));
    let quota = QuotaGuard::new(
        counters.clone(),
        config.traffic_limit_bytes,
        config.traffic_safety_margin,
    );
    let pdf_counters = PdfCounters::new(counters.clone());
    let queue = JobQueue::new(
        Arc::new(RedisQueue::new(conn).with_visibility(config.claim_visibility)),
        config.retry_policy(),
        config.intake_limit(),
    );

    tokio::fs::create_dir_all(&config.asset_root)
        .await
        .with_context(|| format!("Failed to create {}", config.asset_root.display()))?;

    let pipeline = Arc::new(RenderPipeline::new(
        store.clone(),
        quota.clone(),
        pdf_counters.clone(),
        AssetVault::new(config.asset_root.clone()),
        Arc::new(CommandRenderer::new(config.render_timeout)),
    ));

    let shutdown = CancellationToken::new();

    let heartbeat = {
        let queue = queue.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => match queue.metrics().await {
                        Ok(metrics) => telemetry::record_queue_heartbeat(&metrics),
                        Err(e) => error!("Failed to read queue metrics: {}", e),
                    },
                }
            }
        })
    };

    let janitor = {
        let janitor = Janitor::new(counters, quota, pdf_counters, store);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        janitor.tick(Utc::now()).await;
                    }
                }
            }
        })
    };

    let pool = tokio::spawn(WorkerPool::new(queue, pipeline, config.concurrency).run(shutdown.clone()));

    info!("Worker service ready, press Ctrl+C to shutdown");
    signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;

    info!("Received shutdown signal, waiting for workers to finish...");
    shutdown.cancel();

    for (name, handle) in [("worker pool", pool), ("heartbeat", heartbeat), ("janitor", janitor)] {
        if let Err(e) = handle.await {
            error!("{} task ended abnormally: {}", name, e);
        }
    }

    info!("Worker service shutdown complete");
    Ok(())
}
