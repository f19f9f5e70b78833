//! Telemetry and structured logging for the render worker.

use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{global, KeyValue};
use tracing::{info, warn};

use crate::job::{RenderTask, TaskOutcome};
use crate::queue::QueueMetrics;

const TRACER_NAME: &str = "pdf-render-worker";

/// Render duration above which a job is logged as slow.
const SLOW_JOB_THRESHOLD_MS: i64 = 30_000;

/// Records telemetry for a task that reached a terminal outcome.
///
/// Emits one `pdf_render_job` span carrying the handle, engine, attempt,
/// outcome, output size and the time since the task was enqueued.
pub fn record_job_telemetry(task: &RenderTask, outcome: &TaskOutcome) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("pdf_render_job");
    let duration_ms = task.processing_duration_ms();

    span.set_attribute(KeyValue::new("job_id", task.handle.to_string()));
    span.set_attribute(KeyValue::new("engine", task.engine.name()));
    span.set_attribute(KeyValue::new("attempt", task.attempt as i64));
    span.set_attribute(KeyValue::new("duration_ms", duration_ms));
    span.set_attribute(KeyValue::new("data_rows", task.data.len() as i64));
    span.set_attribute(KeyValue::new("has_assets", task.assets.is_some()));

    match outcome {
        TaskOutcome::Succeeded { pdf_bytes } => {
            span.set_attribute(KeyValue::new("status", "success"));
            span.set_attribute(KeyValue::new("pdf_bytes", *pdf_bytes as i64));

            info!(
                job_id = %task.handle,
                engine = %task.engine,
                attempt = task.attempt,
                pdf_bytes = *pdf_bytes,
                duration_ms = duration_ms,
                "PDF render job completed"
            );

            if duration_ms > SLOW_JOB_THRESHOLD_MS {
                warn!(
                    job_id = %task.handle,
                    duration_ms = duration_ms,
                    "PDF render exceeded performance threshold ({}ms)",
                    SLOW_JOB_THRESHOLD_MS
                );
            }
        }
        TaskOutcome::Failed { message } => {
            span.set_attribute(KeyValue::new("status", "error"));
            span.set_attribute(KeyValue::new("error", message.clone()));

            warn!(
                job_id = %task.handle,
                engine = %task.engine,
                attempt = task.attempt,
                error = %message,
                "PDF render job failed"
            );
        }
    }

    span.end();
}

/// Records a queue heartbeat; the binary calls this on a fixed interval.
pub fn record_queue_heartbeat(metrics: &QueueMetrics) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("queue_heartbeat");

    span.set_attribute(KeyValue::new("waiting", metrics.waiting as i64));
    span.set_attribute(KeyValue::new("active", metrics.active as i64));
    span.set_attribute(KeyValue::new("completed", metrics.completed as i64));
    span.set_attribute(KeyValue::new("failed", metrics.failed as i64));
    span.end();

    info!(
        waiting = metrics.waiting,
        active = metrics.active,
        completed = metrics.completed,
        failed = metrics.failed,
        "Queue heartbeat"
    );
}

/// Initializes OpenTelemetry with an OTLP exporter.
///
/// Call once at startup. `endpoint` is the collector address (for example
/// `http://localhost:4317`) and `service_name` labels every span.
pub fn init_telemetry(
    endpoint: &str,
    service_name: &str,
) -> Result<(), opentelemetry::trace::TraceError> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::Config;

    let provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(Config::default().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new("service.name", service_name.to_string()),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?
        .provider();

    match provider {
        Some(provider) => {
            global::set_tracer_provider(provider);
            info!("Telemetry initialized: endpoint={}", endpoint);
        }
        None => warn!("Telemetry pipeline returned no tracer provider"),
    }
    Ok(())
}
