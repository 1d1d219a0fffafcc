//! Full-pipeline tests: manager, worker pool, and artifact store working
//! together, driven by scripted renderers instead of pdfium.
//!
//! Every test runs against a throwaway data directory and a real worker
//! pool, so state transitions, retries, purges, and bundle contents are
//! exercised exactly as in production; only the rasteriser is scripted.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pagemill::jobs::CANCELLED_REASON;
use pagemill::{
    ArtifactStore, JobManager, JobState, PageRenderer, PageStream, RenderError, RenderOptions,
    RenderedPage, ServiceConfig, ServiceConfigBuilder,
};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

const PDF: &[u8] = b"%PDF-1.4 scripted-renderer stand-in";

// ── Scripted renderers ───────────────────────────────────────────────────────

fn page(index: u32) -> Result<RenderedPage, RenderError> {
    Ok(RenderedPage {
        index,
        png: vec![index as u8 + 1; 48],
    })
}

/// Renders `pages` pages on every call.
struct FixedRenderer {
    pages: u32,
}

#[async_trait]
impl PageRenderer for FixedRenderer {
    async fn render(
        &self,
        _document: &Path,
        _options: RenderOptions,
    ) -> Result<PageStream, RenderError> {
        let items: Vec<_> = (0..self.pages).map(page).collect();
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

/// Renders pages up to `fail_at`, then dies with a deterministic page fault.
struct BrokenPageRenderer {
    fail_at: u32,
}

#[async_trait]
impl PageRenderer for BrokenPageRenderer {
    async fn render(
        &self,
        _document: &Path,
        _options: RenderOptions,
    ) -> Result<PageStream, RenderError> {
        let mut items: Vec<_> = (0..self.fail_at).map(page).collect();
        items.push(Err(RenderError::Page {
            index: self.fail_at,
            detail: "corrupt object stream".into(),
        }));
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

/// Fails its first `failures` calls with a transient fault, then succeeds.
struct FlakyRenderer {
    pages: u32,
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyRenderer {
    fn new(pages: u32, failures: usize) -> Self {
        Self {
            pages,
            failures,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PageRenderer for FlakyRenderer {
    async fn render(
        &self,
        _document: &Path,
        _options: RenderOptions,
    ) -> Result<PageStream, RenderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(RenderError::Unavailable {
                detail: format!("backend hiccup on call {call}"),
            });
        }
        let items: Vec<_> = (0..self.pages).map(page).collect();
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

/// First call emits `pages_before_death` pages and then dies mid-stream;
/// every later call renders `pages` pages cleanly.
struct DyingRenderer {
    pages: u32,
    pages_before_death: u32,
    calls: AtomicUsize,
}

#[async_trait]
impl PageRenderer for DyingRenderer {
    async fn render(
        &self,
        _document: &Path,
        _options: RenderOptions,
    ) -> Result<PageStream, RenderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == 0 {
            let mut items: Vec<_> = (0..self.pages_before_death).map(page).collect();
            items.push(Err(RenderError::Interrupted {
                detail: "render thread died".into(),
            }));
            return Ok(Box::pin(futures::stream::iter(items)));
        }
        let items: Vec<_> = (0..self.pages).map(page).collect();
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

/// Emits one page per `delay`, forever-ish. Used to catch a job mid-flight.
struct SlowRenderer {
    pages: u32,
    delay: Duration,
}

#[async_trait]
impl PageRenderer for SlowRenderer {
    async fn render(
        &self,
        _document: &Path,
        _options: RenderOptions,
    ) -> Result<PageStream, RenderError> {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let pages = self.pages;
        let delay = self.delay;
        tokio::spawn(async move {
            for index in 0..pages {
                if tx.send(page(index)).await.is_err() {
                    return;
                }
                tokio::time::sleep(delay).await;
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

fn base_config(dir: &tempfile::TempDir) -> ServiceConfigBuilder {
    // Fast retries so the backoff tests finish in milliseconds.
    ServiceConfig::builder()
        .data_dir(dir.path())
        .retry_backoff_ms(10)
}

fn boot(
    config: ServiceConfig,
    renderer: Arc<dyn PageRenderer>,
    workers: usize,
) -> Arc<JobManager> {
    let store = Arc::new(ArtifactStore::open(&config).unwrap());
    let (manager, queue) = JobManager::new(config, store, renderer);
    pagemill::worker::spawn_workers(Arc::clone(&manager), queue, workers);
    manager
}

async fn wait_terminal(manager: &JobManager, id: Uuid) -> JobState {
    for _ in 0..500 {
        let state = manager.status(id).unwrap().state;
        if state.is_terminal() {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {id} never reached a terminal state");
}

fn bundle_entries(path: &Path) -> Vec<String> {
    let file = std::fs::File::open(path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect()
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn three_page_document_completes_with_a_full_bundle() {
    let dir = tempfile::tempdir().unwrap();
    let manager = boot(
        base_config(&dir).build().unwrap(),
        Arc::new(FixedRenderer { pages: 3 }),
        1,
    );

    let id = manager.submit(Some("report.pdf"), PDF).await.unwrap();
    assert_eq!(wait_terminal(&manager, id).await, JobState::Completed);

    let status = manager.status(id).unwrap();
    assert_eq!(status.pages, 3);
    assert!(status.error.is_none());

    let bundle = manager.result(id).unwrap();
    assert!(bundle.path.exists());
    assert_eq!(
        bundle_entries(&bundle.path),
        vec!["page_0000.png", "page_0001.png", "page_0002.png"]
    );
}

#[tokio::test]
async fn deterministic_page_fault_fails_the_job_and_purges_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let manager = boot(
        base_config(&dir).build().unwrap(),
        Arc::new(BrokenPageRenderer { fail_at: 2 }),
        1,
    );

    let id = manager.submit(None, PDF).await.unwrap();
    assert_eq!(wait_terminal(&manager, id).await, JobState::Failed);

    let status = manager.status(id).unwrap();
    let reason = status.error.expect("failed jobs carry a reason");
    assert!(reason.contains("page 2"), "unexpected reason: {reason}");

    // Partial output must not survive the failure.
    assert!(!dir.path().join("temp_uploads").join(format!("{id}.pdf")).exists());
    assert!(!dir.path().join("converted_images").join(id.to_string()).exists());
    assert!(!dir.path().join("results").join(format!("{id}.zip")).exists());
}

#[tokio::test]
async fn transient_fault_is_retried_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let flaky = Arc::new(FlakyRenderer::new(2, 1));
    let manager = boot(base_config(&dir).build().unwrap(), flaky.clone(), 1);

    let id = manager.submit(None, PDF).await.unwrap();
    assert_eq!(wait_terminal(&manager, id).await, JobState::Completed);

    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2, "one failure, one success");
    assert_eq!(manager.status(id).unwrap().pages, 2);
}

#[tokio::test]
async fn interrupted_stream_is_retried_from_page_zero() {
    let dir = tempfile::tempdir().unwrap();
    let renderer = Arc::new(DyingRenderer {
        pages: 3,
        pages_before_death: 1,
        calls: AtomicUsize::new(0),
    });
    let manager = boot(base_config(&dir).build().unwrap(), renderer.clone(), 1);

    let id = manager.submit(None, PDF).await.unwrap();
    assert_eq!(wait_terminal(&manager, id).await, JobState::Completed);

    // The first attempt delivered one page and died mid-document. The job
    // must carry the full second-attempt output, never the truncated first.
    assert_eq!(renderer.calls.load(Ordering::SeqCst), 2);
    let status = manager.status(id).unwrap();
    assert_eq!(status.pages, 3);
    assert!(status.error.is_none());

    let bundle = manager.result(id).unwrap();
    assert_eq!(
        bundle_entries(&bundle.path),
        vec!["page_0000.png", "page_0001.png", "page_0002.png"]
    );
}

#[tokio::test]
async fn transient_fault_exhausts_the_retry_budget() {
    let dir = tempfile::tempdir().unwrap();
    let flaky = Arc::new(FlakyRenderer::new(1, usize::MAX));
    let manager = boot(
        base_config(&dir).max_render_attempts(2).build().unwrap(),
        flaky.clone(),
        1,
    );

    let id = manager.submit(None, PDF).await.unwrap();
    assert_eq!(wait_terminal(&manager, id).await, JobState::Failed);

    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2, "budget of 2 attempts");
    let reason = manager.status(id).unwrap().error.unwrap();
    assert!(reason.contains("hiccup"), "unexpected reason: {reason}");
}

#[tokio::test]
async fn cancelling_a_running_job_stops_at_a_page_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let manager = boot(
        base_config(&dir).build().unwrap(),
        Arc::new(SlowRenderer {
            pages: 100,
            delay: Duration::from_millis(20),
        }),
        1,
    );

    let id = manager.submit(None, PDF).await.unwrap();

    // Let it get at least one page in before pulling the plug.
    for _ in 0..500 {
        let status = manager.status(id).unwrap();
        if status.state == JobState::Processing && status.pages >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    manager.cancel(id).await.unwrap();
    assert_eq!(wait_terminal(&manager, id).await, JobState::Failed);

    let status = manager.status(id).unwrap();
    assert_eq!(status.error.as_deref(), Some(CANCELLED_REASON));
    assert!(
        status.pages < 100,
        "cancellation must not wait for the whole document"
    );
    assert!(!dir.path().join("converted_images").join(id.to_string()).exists());
}

#[tokio::test]
async fn cancelled_queued_jobs_are_skipped_by_late_workers() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(&dir).build().unwrap();
    let store = Arc::new(ArtifactStore::open(&config).unwrap());
    let (manager, queue) = JobManager::new(config, store, Arc::new(FixedRenderer { pages: 3 }));

    // No workers yet: the job sits in the queue.
    let id = manager.submit(None, PDF).await.unwrap();
    manager.cancel(id).await.unwrap();
    assert_eq!(manager.status(id).unwrap().state, JobState::Failed);

    // Workers arriving later must let the dead id pass through untouched.
    pagemill::worker::spawn_workers(Arc::clone(&manager), queue, 1);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = manager.status(id).unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.error.as_deref(), Some(CANCELLED_REASON));
    assert!(!dir.path().join("converted_images").join(id.to_string()).exists());
}

#[tokio::test]
async fn empty_documents_fail_instead_of_completing_empty() {
    let dir = tempfile::tempdir().unwrap();
    let manager = boot(
        base_config(&dir).build().unwrap(),
        Arc::new(FixedRenderer { pages: 0 }),
        1,
    );

    let id = manager.submit(None, PDF).await.unwrap();
    assert_eq!(wait_terminal(&manager, id).await, JobState::Failed);

    let status = manager.status(id).unwrap();
    assert_eq!(status.pages, 0);
    assert!(status.error.is_some());
    assert!(!dir.path().join("results").join(format!("{id}.zip")).exists());
}

#[tokio::test]
async fn completed_bundles_can_be_fetched_repeatedly() {
    let dir = tempfile::tempdir().unwrap();
    let manager = boot(
        base_config(&dir).build().unwrap(),
        Arc::new(FixedRenderer { pages: 1 }),
        1,
    );

    let id = manager.submit(None, PDF).await.unwrap();
    assert_eq!(wait_terminal(&manager, id).await, JobState::Completed);

    let first = manager.result(id).unwrap();
    let second = manager.result(id).unwrap();
    assert_eq!(first.path, second.path);
    assert!(second.path.exists(), "fetching a result must not consume it");
}

#[tokio::test]
async fn workers_drain_a_backlog_in_parallel() {
    let dir = tempfile::tempdir().unwrap();
    let manager = boot(
        base_config(&dir).build().unwrap(),
        Arc::new(FixedRenderer { pages: 2 }),
        4,
    );

    let mut ids = Vec::new();
    for _ in 0..8 {
        ids.push(manager.submit(None, PDF).await.unwrap());
    }
    for id in &ids {
        assert_eq!(wait_terminal(&manager, *id).await, JobState::Completed);
    }

    let counts = manager.counts();
    assert_eq!(counts.completed, 8);
    assert_eq!(counts.failed, 0);
}
