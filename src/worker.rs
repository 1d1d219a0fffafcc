//! Worker pool: pulls job ids off the shared queue, drives the engine, and
//! translates every outcome into a terminal job state.
//!
//! No error escapes a worker. Conversion faults, I/O faults, and
//! cancellation all end as `Failed` with a human-readable reason; success
//! ends as `Completed` with a result bundle attached. Cleanup is best-effort
//! and the retention sweeper picks up anything left behind.
//!
//! Retry policy:
//! * I/O faults are retried exactly once, immediately.
//! * Transient renderer faults are retried up to `max_render_attempts` with
//!   doubling backoff starting at `retry_backoff_ms`.
//! * Deterministic faults (unopenable or empty documents, broken pages) and
//!   invariant violations are never retried.
//!
//! Between attempts the pages written so far are discarded, so every attempt
//! starts again at page 0.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::PageSink;
use crate::error::PagemillError;
use crate::jobs::{CancelToken, JobManager, JobRegistry, JobState, CANCELLED_REASON};
use crate::render::RenderedPage;
use crate::store::{ArtifactRef, ArtifactStore};

/// Spawn `count` workers sharing one queue receiver.
///
/// Workers exit when the queue closes, which happens when the last
/// [`JobManager`] handle is dropped.
pub fn spawn_workers(
    manager: Arc<JobManager>,
    queue: mpsc::Receiver<Uuid>,
    count: usize,
) -> Vec<JoinHandle<()>> {
    let queue = Arc::new(Mutex::new(queue));
    (0..count)
        .map(|worker| {
            let manager = Arc::clone(&manager);
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                info!(worker, "worker started");
                loop {
                    let next = queue.lock().await.recv().await;
                    let Some(id) = next else {
                        info!(worker, "queue closed; worker exiting");
                        break;
                    };
                    process(worker, &manager, id).await;
                }
            })
        })
        .collect()
}

/// Run one job from queue pickup to a terminal state.
async fn process(worker: usize, manager: &JobManager, id: Uuid) {
    let Some(job) = manager.registry().get(id) else {
        warn!(job = %id, "queued id has no record; dropping");
        return;
    };
    // Cancelled-while-queued jobs are already terminal; let them pass by.
    if job.state != JobState::Queued {
        info!(job = %id, state = %job.state, "skipping job no longer queued");
        return;
    }
    if let Err(err) = manager.registry().transition(id, JobState::Processing) {
        error!(job = %id, error = %err, "could not start job");
        return;
    }
    info!(job = %id, worker, "processing");

    match run_attempts(manager, id, &job.cancel, &job.source.path).await {
        Ok(bundle) => {
            let pages = manager.registry().get(id).map_or(0, |j| j.pages.len());
            match manager.registry().complete(id, bundle) {
                Ok(()) => info!(job = %id, pages, "completed"),
                Err(err) => {
                    // The job went terminal underneath us (cancel race);
                    // nothing will ever serve this bundle.
                    error!(job = %id, error = %err, "could not record completion");
                    manager.purge_best_effort(id).await;
                }
            }
        }
        Err(PagemillError::Cancelled) => {
            manager.purge_best_effort(id).await;
            if let Err(err) = manager.registry().fail(id, CANCELLED_REASON) {
                error!(job = %id, error = %err, "could not record cancellation");
            }
            info!(job = %id, "cancelled during processing");
        }
        Err(err) => {
            error!(job = %id, error = %err, "job failed");
            manager.purge_best_effort(id).await;
            if let Err(record_err) = manager.registry().fail(id, &err.to_string()) {
                error!(job = %id, error = %record_err, "could not record failure");
            }
        }
    }
}

/// Drive conversion attempts until success, a non-retryable fault, or the
/// retry budget runs out.
async fn run_attempts(
    manager: &JobManager,
    id: Uuid,
    cancel: &CancelToken,
    source: &Path,
) -> Result<ArtifactRef, PagemillError> {
    let config = manager.config();
    let mut attempt: u32 = 1;
    let mut io_retried = false;

    loop {
        match convert_once(manager, id, cancel, source).await {
            Ok(bundle) => return Ok(bundle),
            Err(err @ PagemillError::Io { .. }) if !io_retried => {
                io_retried = true;
                warn!(job = %id, error = %err, "I/O fault; retrying once");
                prepare_retry(manager, id).await?;
            }
            Err(PagemillError::Conversion(fault))
                if fault.is_transient() && attempt < config.max_render_attempts =>
            {
                let delay = backoff_delay(config.retry_backoff_ms, attempt);
                warn!(
                    job = %id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %fault,
                    "transient conversion fault; backing off"
                );
                tokio::time::sleep(delay).await;
                prepare_retry(manager, id).await?;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// One full pass: render every page into the store, then bundle.
async fn convert_once(
    manager: &JobManager,
    id: Uuid,
    cancel: &CancelToken,
    source: &Path,
) -> Result<ArtifactRef, PagemillError> {
    let mut sink = StoreSink {
        store: manager.store(),
        registry: manager.registry(),
        job: id,
    };
    manager.engine().convert(id, source, cancel, &mut sink).await?;
    manager.store().finalize_result(id).await
}

/// Clear partial output so the next attempt starts at page 0.
async fn prepare_retry(manager: &JobManager, id: Uuid) -> Result<(), PagemillError> {
    manager.store().discard_pages(id).await?;
    manager.registry().reset_pages(id)
}

/// Doubling backoff: `base_ms * 2^(attempt-1)`.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    Duration::from_millis(base_ms.saturating_mul(1u64 << (attempt - 1).min(16)))
}

/// Sink that lands pages in the Artifact Store and mirrors them into the
/// registry so status polls see progress.
struct StoreSink<'a> {
    store: &'a ArtifactStore,
    registry: &'a JobRegistry,
    job: Uuid,
}

#[async_trait]
impl PageSink for StoreSink<'_> {
    async fn accept(&mut self, page: &RenderedPage) -> Result<(), PagemillError> {
        let artifact = self
            .store
            .write_page_image(self.job, page.index, &page.png)
            .await?;
        self.registry.record_page(self.job, artifact)
    }
}
