//! End-to-end render flow: admission, queue, worker pool and status queries
//! over the in-memory backends with a mocked rendering engine.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use mockall::mock;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use zip::write::SimpleFileOptions;

use worker_render::assets::AssetVault;
use worker_render::counters::{
    CounterStore, MemoryCounters, PdfCounters, PDF_MONTH_KEY, PDF_TOTAL_KEY, PDF_WEEK_KEY,
    TRAFFIC_KEY,
};
use worker_render::job::{Engine, JobHandle};
use worker_render::pipeline::RenderPipeline;
use worker_render::queue::{IntakeLimit, JobQueue, MemoryQueue, RetryPolicy};
use worker_render::quota::QuotaGuard;
use worker_render::renderer::{RenderError, Renderer};
use worker_render::service::{RenderResponse, RenderService, ServiceError};
use worker_render::store::MemoryJobStore;
use worker_render::worker::WorkerPool;

mock! {
    pub Engines {}

    #[async_trait]
    impl Renderer for Engines {
        async fn render(&self, html: &str, engine: Engine) -> Result<Vec<u8>, RenderError>;
    }
}

const TIB: u64 = 1 << 40;
const LIMIT: u64 = 20 * TIB;
const PDF: &[u8] = b"%PDF-1.7\n%fake\n%%EOF";

struct Harness {
    service: RenderService,
    store: Arc<MemoryJobStore>,
    counters: Arc<MemoryCounters>,
    queue: JobQueue,
    pipeline: Arc<RenderPipeline>,
    assets: TempDir,
}

impl Harness {
    fn new(renderer: MockEngines) -> Self {
        let store = Arc::new(MemoryJobStore::new());
        let counters = Arc::new(MemoryCounters::new());
        let assets = TempDir::new().unwrap();
        let quota = QuotaGuard::new(counters.clone(), LIMIT, 0.95);
        let pdf_counters = PdfCounters::new(counters.clone());

        let queue = JobQueue::new(
            Arc::new(MemoryQueue::new()),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
            },
            IntakeLimit::new(100, Duration::from_secs(60)),
        )
        .with_claim_timeout(Duration::from_millis(50));

        let pipeline = Arc::new(RenderPipeline::new(
            store.clone(),
            quota.clone(),
            pdf_counters.clone(),
            AssetVault::new(assets.path()),
            Arc::new(renderer),
        ));
        let service = RenderService::new(store.clone(), queue.clone(), quota, pdf_counters)
            .with_sync_timeout(Duration::from_secs(10));

        Self {
            service,
            store,
            counters,
            queue,
            pipeline,
            assets,
        }
    }

    fn start_workers(&self) -> Workers {
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::new(self.queue.clone(), self.pipeline.clone(), 2);
        let handle = tokio::spawn(pool.run(shutdown.clone()));
        Workers { shutdown, handle }
    }

    async fn submit(&self, body: serde_json::Value) -> Result<RenderResponse, ServiceError> {
        self.service.handle_json(body.to_string().as_bytes()).await
    }

    async fn wait_for_pdf(&self, pdfid: &JobHandle) -> Vec<u8> {
        for _ in 0..500 {
            match self.service.query_status(pdfid).await.unwrap() {
                RenderResponse::Pdf(pdf) => return pdf,
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        panic!("job {pdfid} never finished");
    }

    fn asset_root_is_empty(&self) -> bool {
        std::fs::read_dir(self.assets.path()).unwrap().next().is_none()
    }
}

struct Workers {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl Workers {
    async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap();
    }
}

fn rendering_engine() -> MockEngines {
    let mut engines = MockEngines::new();
    engines.expect_render().returning(|_, _| Ok(PDF.to_vec()));
    engines
}

fn accepted(response: RenderResponse) -> JobHandle {
    match response {
        RenderResponse::Accepted { pdfid } => pdfid,
        other => panic!("expected accepted, got {other:?}"),
    }
}

fn asset_bundle() -> String {
    use base64::Engine as _;

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    writer.start_file("img/logo.png", options).unwrap();
    writer
        .write_all(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR")
        .unwrap();
    let zip = writer.finish().unwrap().into_inner();
    base64::engine::general_purpose::STANDARD.encode(zip)
}

fn first_of_next_month() -> NaiveDate {
    let today = Utc::now().date_naive();
    let (year, month) = if today.month() == 12 {
        (today.year() + 1, 1)
    } else {
        (today.year(), today.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap()
}

#[tokio::test]
async fn test_sync_submission_returns_pdf() {
    let harness = Harness::new(rendering_engine());
    let workers = harness.start_workers();

    let response = harness
        .submit(json!({"html": "<p>hi</p>", "sync": true}))
        .await
        .unwrap();
    assert_eq!(response.content_type(), "application/pdf");
    assert_eq!(response.status_code(), 200);
    assert_eq!(response, RenderResponse::Pdf(PDF.to_vec()));

    // Delivered once, then gone.
    assert_eq!(harness.store.len().await, 0);

    let counts = harness.service.pdf_counts().await.unwrap();
    assert_eq!((counts.total, counts.week, counts.month), (1, 1, 1));
    assert_eq!(
        harness.counters.read(TRAFFIC_KEY).await.unwrap(),
        PDF.len() as u64
    );

    workers.stop().await;
}

#[tokio::test]
async fn test_async_markdown_submission_is_polled_to_completion() {
    let mut engines = MockEngines::new();
    engines
        .expect_render()
        .withf(|html, engine| html.contains("<h1>Title</h1>") && *engine == Engine::WeasyPrint)
        .times(1)
        .returning(|_, _| Ok(PDF.to_vec()));
    let harness = Harness::new(engines);

    let pdfid = accepted(
        harness
            .submit(json!({"markdown": "# Title", "data": [{"name": "Al"}], "sync": false}))
            .await
            .unwrap(),
    );

    // Non-terminal polls are repeatable and change nothing.
    for _ in 0..3 {
        let status = harness.service.query_status(&pdfid).await.unwrap();
        assert_eq!(
            status.json(),
            Some(json!({
                "pdfid": pdfid.as_str(),
                "status": "open",
                "message": "PDF rendering has not started yet",
            }))
        );
    }

    let workers = harness.start_workers();
    assert_eq!(harness.wait_for_pdf(&pdfid).await, PDF);

    let err = harness.service.query_status(&pdfid).await.unwrap_err();
    assert_eq!(err.status_code(), 400);
    assert_eq!(
        err.body(),
        json!({"pdfid": pdfid.as_str(), "status": "error", "message": "pdfid invalid"})
    );

    workers.stop().await;
}

#[tokio::test]
async fn test_status_query_through_request_body() {
    let harness = Harness::new(rendering_engine());
    let pdfid = accepted(
        harness
            .submit(json!({"html": "<p>later</p>", "options": {"sync": "false"}}))
            .await
            .unwrap(),
    );

    let workers = harness.start_workers();
    let mut delivered = None;
    for _ in 0..500 {
        match harness.submit(json!({"pdfid": pdfid.as_str()})).await.unwrap() {
            RenderResponse::Pdf(pdf) => {
                delivered = Some(pdf);
                break;
            }
            RenderResponse::Status { status, .. } => {
                assert!(!status.is_terminal());
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            other => panic!("unexpected response {other:?}"),
        }
    }
    assert_eq!(delivered.as_deref(), Some(PDF));

    workers.stop().await;
}

#[tokio::test]
async fn test_javascript_with_weasyprint_is_rejected_before_queueing() {
    let mut engines = MockEngines::new();
    engines.expect_render().never();
    let harness = Harness::new(engines);

    let err = harness
        .submit(json!({"html": "<p/>", "javascript": "run()", "renderer": "weasyprint"}))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
    assert_eq!(err.status_code(), 400);
    assert_eq!(harness.queue.metrics().await.unwrap().waiting, 0);
    assert_eq!(harness.store.len().await, 0);
}

#[tokio::test]
async fn test_quota_exhaustion_rejects_submission() {
    let harness = Harness::new(MockEngines::new());
    harness
        .counters
        .increment(TRAFFIC_KEY, LIMIT / 100 * 96)
        .await
        .unwrap();

    let err = harness
        .submit(json!({"html": "<p>hi</p>"}))
        .await
        .unwrap_err();
    let ServiceError::QuotaExceeded { reset_date, .. } = &err else {
        panic!("expected quota error, got {err:?}");
    };
    assert_eq!(*reset_date, first_of_next_month());
    assert_eq!(err.status_code(), 503);
    assert_eq!(
        err.body()["resetDate"],
        first_of_next_month().to_string().as_str()
    );
    assert_eq!(harness.queue.metrics().await.unwrap().waiting, 0);
}

#[tokio::test]
async fn test_malformed_assets_are_rejected_before_queueing() {
    let harness = Harness::new(MockEngines::new());

    let err = harness
        .submit(json!({"html": "<p/>", "assets": "not//base64!!"}))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);
    assert_eq!(
        err.body(),
        json!({"message": "Can not base64 decode the assets zip file"})
    );
    assert_eq!(harness.store.len().await, 0);
    assert_eq!(harness.queue.metrics().await.unwrap().waiting, 0);
}

#[tokio::test]
async fn test_javascript_selects_capable_engine() {
    let mut engines = MockEngines::new();
    engines
        .expect_render()
        .withf(|html, engine| *engine == Engine::PagedJs && html.contains(">go()</script>"))
        .times(1)
        .returning(|_, _| Ok(PDF.to_vec()));
    let harness = Harness::new(engines);
    let workers = harness.start_workers();

    let response = harness
        .submit(json!({"html": "<p>js</p>", "javascript": "go()"}))
        .await
        .unwrap();
    assert_eq!(response, RenderResponse::Pdf(PDF.to_vec()));

    workers.stop().await;
}

#[tokio::test]
async fn test_assets_are_resolved_and_removed_after_success() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut engines = MockEngines::new();
    let captured = seen.clone();
    engines.expect_render().returning(move |html, _| {
        captured.lock().unwrap().push(html.to_string());
        Ok(PDF.to_vec())
    });
    let harness = Harness::new(engines);
    let workers = harness.start_workers();

    let response = harness
        .submit(json!({"html": "<img src=\"img/logo.png\">", "assets": asset_bundle()}))
        .await
        .unwrap();
    assert_eq!(response, RenderResponse::Pdf(PDF.to_vec()));

    let html = seen.lock().unwrap().pop().unwrap();
    let root = harness.assets.path().to_string_lossy().into_owned();
    assert!(html.contains(&format!("{root}/")), "unresolved asset in {html}");
    assert!(html.contains("img/logo.png"));
    assert!(harness.asset_root_is_empty());

    workers.stop().await;
}

#[tokio::test]
async fn test_failing_engine_exhausts_retries_and_cleans_up() {
    let mut engines = MockEngines::new();
    engines
        .expect_render()
        .times(3)
        .returning(|_, engine| Err(RenderError::EmptyOutput { engine }));
    let harness = Harness::new(engines);
    let workers = harness.start_workers();

    let err = harness
        .submit(json!({"html": "<img src=\"img/logo.png\">", "assets": asset_bundle()}))
        .await
        .unwrap_err();
    let ServiceError::JobFailed { message, .. } = &err else {
        panic!("expected failed job, got {err:?}");
    };
    assert_eq!(message, "weasyprint produced no output");
    assert_eq!(err.status_code(), 400);

    assert!(harness.asset_root_is_empty());
    assert_eq!(harness.store.len().await, 0);
    assert_eq!(harness.counters.read(PDF_TOTAL_KEY).await.unwrap(), 0);
    assert_eq!(harness.counters.read(TRAFFIC_KEY).await.unwrap(), 0);

    let metrics = harness.queue.metrics().await.unwrap();
    assert_eq!((metrics.active, metrics.failed), (0, 1));

    workers.stop().await;
}

#[tokio::test]
async fn test_engine_recovers_on_retry() {
    let mut engines = MockEngines::new();
    let mut calls = 0;
    engines.expect_render().times(2).returning(move |_, engine| {
        calls += 1;
        if calls == 1 {
            Err(RenderError::Failed {
                engine,
                status: "exit status: 1".to_string(),
                stderr: "font cache busy".to_string(),
            })
        } else {
            Ok(PDF.to_vec())
        }
    });
    let harness = Harness::new(engines);
    let workers = harness.start_workers();

    let response = harness.submit(json!({"html": "<p>again</p>"})).await.unwrap();
    assert_eq!(response, RenderResponse::Pdf(PDF.to_vec()));
    assert_eq!(harness.counters.read(PDF_WEEK_KEY).await.unwrap(), 1);
    assert_eq!(harness.counters.read(PDF_MONTH_KEY).await.unwrap(), 1);

    let metrics = harness.queue.metrics().await.unwrap();
    assert_eq!((metrics.completed, metrics.failed), (1, 0));

    workers.stop().await;
}

#[tokio::test]
async fn test_data_rows_render_into_one_document() {
    let mut engines = MockEngines::new();
    engines
        .expect_render()
        .withf(|html, _| match (html.find("Dear Al"), html.find("Dear Bo")) {
            (Some(al), Some(bo)) => al < bo,
            _ => false,
        })
        .times(1)
        .returning(|_, _| Ok(PDF.to_vec()));
    let harness = Harness::new(engines);
    let workers = harness.start_workers();

    let response = harness
        .submit(json!({
            "html": "<p>Dear {{ name }}</p>",
            "data": [{"name": "Al"}, {"name": "Bo"}],
        }))
        .await
        .unwrap();
    assert_eq!(response, RenderResponse::Pdf(PDF.to_vec()));

    workers.stop().await;
}
