//! Job lifecycle: identifiers, the state machine, the in-memory registry,
//! and the [`JobManager`] front door that the HTTP layer talks to.
//!
//! Job metadata lives only in memory. Artifacts on disk outlive a restart and
//! are reclaimed by the retention sweeper; the records pointing at them are
//! not, so a restarted service starts with an empty registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::engine::ConversionEngine;
use crate::error::PagemillError;
use crate::render::{PageRenderer, RenderOptions};
use crate::store::{ArtifactRef, ArtifactStore};

/// Reason string recorded when a job is cancelled by request.
pub const CANCELLED_REASON: &str = "cancelled";

// ── Cancellation ────────────────────────────────────────────────────────────

/// Shared cancellation flag, checked at page boundaries.
///
/// Clones observe the same flag. Once set it never clears.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ── State machine ───────────────────────────────────────────────────────────

/// Lifecycle of a conversion job. Transitions are monotonic; the two
/// terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Whether moving from `self` to `next` is a legal step.
    pub fn can_transition(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Processing)
                | (JobState::Queued, JobState::Failed)
                | (JobState::Processing, JobState::Completed)
                | (JobState::Processing, JobState::Failed)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(name)
    }
}

// ── Records ─────────────────────────────────────────────────────────────────

/// Everything the service tracks about one job.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub state: JobState,
    pub source: ArtifactRef,
    pub pages: Vec<ArtifactRef>,
    pub result: Option<ArtifactRef>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cancel: CancelToken,
}

impl Job {
    fn new(id: Uuid, source: ArtifactRef) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: JobState::Queued,
            source,
            pages: Vec::new(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            cancel: CancelToken::new(),
        }
    }
}

/// Client-facing snapshot of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: Uuid,
    pub state: JobState,
    /// Pages written so far (final count once terminal).
    pub pages: u32,
    /// Failure reason; `null` until the job fails.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for JobStatus {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            state: job.state,
            pages: job.pages.len() as u32,
            error: job.error.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// Registry size broken down by state, reported by the health endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct JobCounts {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobCounts {
    pub fn total(&self) -> usize {
        self.queued + self.processing + self.completed + self.failed
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

/// In-memory job table. All mutation goes through methods that enforce the
/// state machine; an illegal transition is an internal defect, not a client
/// error.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: DashMap<Uuid, Job>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Job) {
        self.jobs.insert(job.id, job);
    }

    pub fn remove(&self, id: Uuid) {
        self.jobs.remove(&id);
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.jobs.get(&id).map(|entry| entry.clone())
    }

    pub fn snapshot(&self, id: Uuid) -> Option<JobStatus> {
        self.jobs.get(&id).map(|entry| JobStatus::from(&*entry))
    }

    /// All jobs, newest first.
    pub fn list(&self) -> Vec<JobStatus> {
        let mut all: Vec<JobStatus> = self
            .jobs
            .iter()
            .map(|entry| JobStatus::from(&*entry))
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    pub fn counts(&self) -> JobCounts {
        let mut counts = JobCounts::default();
        for entry in self.jobs.iter() {
            match entry.state {
                JobState::Queued => counts.queued += 1,
                JobState::Processing => counts.processing += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Move `id` to `next`, enforcing the state machine.
    pub fn transition(&self, id: Uuid, next: JobState) -> Result<(), PagemillError> {
        let mut entry = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| PagemillError::NotFound(id.to_string()))?;
        if !entry.state.can_transition(next) {
            return Err(PagemillError::Internal(format!(
                "illegal transition {} -> {} for job {}",
                entry.state, next, id
            )));
        }
        entry.state = next;
        entry.updated_at = Utc::now();
        Ok(())
    }

    /// Record one finished page artifact.
    ///
    /// Pages arriving after the job left `Processing` (a cancellation racing
    /// the worker) are dropped; the teardown purge removes their files.
    pub fn record_page(&self, id: Uuid, page: ArtifactRef) -> Result<(), PagemillError> {
        let mut entry = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| PagemillError::NotFound(id.to_string()))?;
        if entry.state != JobState::Processing {
            warn!(job = %id, state = %entry.state, "dropping page recorded outside processing");
            return Ok(());
        }
        entry.pages.push(page);
        entry.updated_at = Utc::now();
        Ok(())
    }

    /// Forget recorded pages ahead of a retry. The disk artifacts are
    /// discarded separately.
    pub fn reset_pages(&self, id: Uuid) -> Result<(), PagemillError> {
        let mut entry = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| PagemillError::NotFound(id.to_string()))?;
        entry.pages.clear();
        entry.updated_at = Utc::now();
        Ok(())
    }

    /// Terminal success: attach the result bundle.
    pub fn complete(&self, id: Uuid, result: ArtifactRef) -> Result<(), PagemillError> {
        let mut entry = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| PagemillError::NotFound(id.to_string()))?;
        if !entry.state.can_transition(JobState::Completed) {
            return Err(PagemillError::Internal(format!(
                "illegal transition {} -> completed for job {}",
                entry.state, id
            )));
        }
        entry.state = JobState::Completed;
        entry.result = Some(result);
        entry.updated_at = Utc::now();
        Ok(())
    }

    /// Terminal failure with a human-readable reason.
    ///
    /// A job already terminal stays as it is; late failure reports lose the
    /// race and are dropped with a warning.
    pub fn fail(&self, id: Uuid, reason: &str) -> Result<(), PagemillError> {
        let mut entry = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| PagemillError::NotFound(id.to_string()))?;
        if entry.state.is_terminal() {
            warn!(job = %id, state = %entry.state, reason, "dropping late failure report");
            return Ok(());
        }
        entry.state = JobState::Failed;
        entry.error = Some(reason.to_string());
        entry.updated_at = Utc::now();
        Ok(())
    }

    pub fn cancel_token(&self, id: Uuid) -> Option<CancelToken> {
        self.jobs.get(&id).map(|entry| entry.cancel.clone())
    }

    /// Drop terminal records last touched before `cutoff`. Returns how many
    /// were evicted.
    pub fn evict_terminal_before(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.jobs.len();
        self.jobs
            .retain(|_, job| !(job.state.is_terminal() && job.updated_at < cutoff));
        before - self.jobs.len()
    }
}

// ── Manager ─────────────────────────────────────────────────────────────────

/// Front door for job operations: validates uploads, owns the registry and
/// the work queue, and answers status/result/cancel requests.
pub struct JobManager {
    registry: Arc<JobRegistry>,
    store: Arc<ArtifactStore>,
    engine: Arc<ConversionEngine>,
    queue: mpsc::Sender<Uuid>,
    config: ServiceConfig,
}

impl JobManager {
    /// Build the manager and hand back the queue receiver for the worker
    /// pool to consume.
    pub fn new(
        config: ServiceConfig,
        store: Arc<ArtifactStore>,
        renderer: Arc<dyn PageRenderer>,
    ) -> (Arc<Self>, mpsc::Receiver<Uuid>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let engine = Arc::new(ConversionEngine::new(renderer, RenderOptions::from(&config)));
        let manager = Arc::new(Self {
            registry: Arc::new(JobRegistry::new()),
            store,
            engine,
            queue: tx,
            config,
        });
        (manager, rx)
    }

    pub(crate) fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub(crate) fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub(crate) fn engine(&self) -> &ConversionEngine {
        &self.engine
    }

    pub(crate) fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Accept an upload: validate, persist, register, enqueue.
    pub async fn submit(
        &self,
        filename: Option<&str>,
        bytes: &[u8],
    ) -> Result<Uuid, PagemillError> {
        if bytes.is_empty() {
            return Err(PagemillError::invalid_input("empty upload"));
        }
        if let Some(name) = filename {
            if !name.to_ascii_lowercase().ends_with(".pdf") {
                return Err(PagemillError::invalid_input(format!(
                    "unsupported file type '{name}': only .pdf is accepted"
                )));
            }
        }
        if !bytes.starts_with(b"%PDF-") {
            return Err(PagemillError::invalid_input(
                "not a PDF document (missing %PDF- header)",
            ));
        }

        let id = Uuid::new_v4();
        let source = self.store.save_upload(id, bytes).await?;
        self.registry.insert(Job::new(id, source));

        if self.queue.try_send(id).is_err() {
            // Roll back so nothing dangles for a job that never existed.
            self.registry.remove(id);
            if let Err(purge_err) = self.store.purge(id).await {
                warn!(job = %id, error = %purge_err, "rollback purge failed");
            }
            return Err(PagemillError::Busy("job queue is full".into()));
        }

        info!(job = %id, bytes = bytes.len(), "job queued");
        Ok(id)
    }

    /// Current status snapshot.
    pub fn status(&self, id: Uuid) -> Result<JobStatus, PagemillError> {
        self.registry
            .snapshot(id)
            .ok_or_else(|| PagemillError::NotFound(id.to_string()))
    }

    /// All jobs, newest first.
    pub fn list(&self) -> Vec<JobStatus> {
        self.registry.list()
    }

    pub fn counts(&self) -> JobCounts {
        self.registry.counts()
    }

    /// The result bundle for a completed job.
    pub fn result(&self, id: Uuid) -> Result<ArtifactRef, PagemillError> {
        let job = self.registry.get(id).ok_or_else(|| PagemillError::NotFound(id.to_string()))?;
        match job.state {
            JobState::Completed => job.result.ok_or_else(|| {
                PagemillError::Internal(format!("job {id} completed without a result bundle"))
            }),
            state => Err(PagemillError::NotReady {
                job: id,
                detail: format!("job is {state}"),
            }),
        }
    }

    /// Cancel a job.
    ///
    /// Queued jobs fail immediately and their artifacts are purged. Running
    /// jobs get their token flipped and the worker finishes the teardown at
    /// the next page boundary. Terminal jobs only have their artifacts
    /// purged; the record stays for status queries.
    pub async fn cancel(&self, id: Uuid) -> Result<(), PagemillError> {
        let job = self.registry.get(id).ok_or_else(|| PagemillError::NotFound(id.to_string()))?;
        job.cancel.cancel();

        match job.state {
            JobState::Queued => {
                self.registry.fail(id, CANCELLED_REASON)?;
                self.purge_best_effort(id).await;
                info!(job = %id, "cancelled while queued");
            }
            JobState::Processing => {
                info!(job = %id, "cancellation requested; worker will stop at the next page");
            }
            JobState::Completed | JobState::Failed => {
                self.purge_best_effort(id).await;
                info!(job = %id, "artifacts purged for terminal job");
            }
        }
        Ok(())
    }

    /// Purge that never fails the caller; cleanup problems are logged and
    /// left to the retention sweeper.
    pub(crate) async fn purge_best_effort(&self, id: Uuid) {
        if let Err(err) = self.store.purge(id).await {
            warn!(job = %id, error = %err, "artifact purge failed; sweeper will retry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ArtifactRole;
    use std::path::PathBuf;

    fn source_ref(id: Uuid) -> ArtifactRef {
        ArtifactRef {
            job: id,
            role: ArtifactRole::Upload,
            path: PathBuf::from(format!("/tmp/{id}.pdf")),
        }
    }

    fn registry_with_job() -> (JobRegistry, Uuid) {
        let registry = JobRegistry::new();
        let id = Uuid::new_v4();
        registry.insert(Job::new(id, source_ref(id)));
        (registry, id)
    }

    #[test]
    fn transitions_follow_the_state_machine() {
        use JobState::*;
        let legal = [
            (Queued, Processing),
            (Queued, Failed),
            (Processing, Completed),
            (Processing, Failed),
        ];
        for (from, to) in legal {
            assert!(from.can_transition(to), "{from} -> {to} should be legal");
        }
        let illegal = [
            (Queued, Completed),
            (Processing, Queued),
            (Completed, Failed),
            (Completed, Processing),
            (Failed, Queued),
            (Failed, Completed),
        ];
        for (from, to) in illegal {
            assert!(!from.can_transition(to), "{from} -> {to} should be illegal");
        }
    }

    #[test]
    fn illegal_transition_is_an_internal_defect() {
        let (registry, id) = registry_with_job();
        let err = registry.transition(id, JobState::Completed).unwrap_err();
        assert!(matches!(err, PagemillError::Internal(_)));
    }

    #[test]
    fn transition_on_unknown_job_is_not_found() {
        let registry = JobRegistry::new();
        let ghost = Uuid::new_v4();
        let err = registry.transition(ghost, JobState::Processing).unwrap_err();
        assert!(matches!(err, PagemillError::NotFound(id) if id == ghost.to_string()));
    }

    #[test]
    fn terminal_states_swallow_late_failures() {
        let (registry, id) = registry_with_job();
        registry.transition(id, JobState::Processing).unwrap();
        registry
            .complete(
                id,
                ArtifactRef {
                    job: id,
                    role: ArtifactRole::ResultBundle,
                    path: PathBuf::from("/tmp/out.zip"),
                },
            )
            .unwrap();

        registry.fail(id, "too late").unwrap();
        let status = registry.snapshot(id).unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert!(status.error.is_none());
    }

    #[test]
    fn pages_recorded_outside_processing_are_dropped() {
        let (registry, id) = registry_with_job();
        registry.fail(id, CANCELLED_REASON).unwrap();

        registry
            .record_page(
                id,
                ArtifactRef {
                    job: id,
                    role: ArtifactRole::PageImage,
                    path: PathBuf::from("/tmp/page_0000.png"),
                },
            )
            .unwrap();

        assert_eq!(registry.snapshot(id).unwrap().pages, 0);
    }

    #[test]
    fn status_serializes_lowercase_states() {
        let (registry, id) = registry_with_job();
        let status = registry.snapshot(id).unwrap();
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "queued");
        assert_eq!(json["pages"], 0);
        assert_eq!(json.get("error"), Some(&serde_json::Value::Null));
    }

    #[test]
    fn eviction_only_touches_old_terminal_jobs() {
        let registry = JobRegistry::new();
        let queued = Uuid::new_v4();
        let failed = Uuid::new_v4();
        registry.insert(Job::new(queued, source_ref(queued)));
        registry.insert(Job::new(failed, source_ref(failed)));
        registry.transition(failed, JobState::Failed).unwrap();

        // Cutoff in the past: nothing is old enough yet.
        let past = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(registry.evict_terminal_before(past), 0);

        // Cutoff in the future: the failed job goes, the queued one stays.
        let future = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(registry.evict_terminal_before(future), 1);
        assert!(registry.get(failed).is_none());
        assert!(registry.get(queued).is_some());
    }

    #[test]
    fn cancel_token_clones_share_the_flag() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    mod manager {
        use super::*;
        use crate::render::{PageRenderer, PageStream, RenderOptions};
        use crate::error::RenderError;
        use async_trait::async_trait;
        use std::path::Path;

        struct NeverRenderer;

        #[async_trait]
        impl PageRenderer for NeverRenderer {
            async fn render(
                &self,
                _document: &Path,
                _options: RenderOptions,
            ) -> Result<PageStream, RenderError> {
                unreachable!("no worker pool is running in these tests")
            }
        }

        async fn manager_in(
            dir: &tempfile::TempDir,
            queue_capacity: usize,
        ) -> (Arc<JobManager>, mpsc::Receiver<Uuid>) {
            let config = ServiceConfig::builder()
                .data_dir(dir.path())
                .queue_capacity(queue_capacity)
                .build()
                .unwrap();
            let store = Arc::new(ArtifactStore::open(&config).unwrap());
            JobManager::new(config, store, Arc::new(NeverRenderer))
        }

        const PDF: &[u8] = b"%PDF-1.4 minimal body";

        #[tokio::test]
        async fn submit_rejects_empty_uploads() {
            let dir = tempfile::tempdir().unwrap();
            let (manager, _rx) = manager_in(&dir, 8).await;
            let err = manager.submit(Some("a.pdf"), b"").await.unwrap_err();
            assert!(matches!(err, PagemillError::InvalidInput { .. }));
            assert!(manager.list().is_empty());
        }

        #[tokio::test]
        async fn submit_rejects_wrong_magic() {
            let dir = tempfile::tempdir().unwrap();
            let (manager, _rx) = manager_in(&dir, 8).await;
            let err = manager
                .submit(Some("a.pdf"), b"GIF89a not a pdf")
                .await
                .unwrap_err();
            assert!(matches!(err, PagemillError::InvalidInput { .. }));
        }

        #[tokio::test]
        async fn submit_rejects_non_pdf_filenames() {
            let dir = tempfile::tempdir().unwrap();
            let (manager, _rx) = manager_in(&dir, 8).await;
            let err = manager.submit(Some("notes.docx"), PDF).await.unwrap_err();
            assert!(matches!(err, PagemillError::InvalidInput { .. }));
        }

        #[tokio::test]
        async fn submit_queues_and_reports_status() {
            let dir = tempfile::tempdir().unwrap();
            let (manager, mut rx) = manager_in(&dir, 8).await;

            let id = manager.submit(Some("doc.pdf"), PDF).await.unwrap();
            assert_eq!(rx.recv().await, Some(id));

            let status = manager.status(id).unwrap();
            assert_eq!(status.state, JobState::Queued);
            assert_eq!(status.pages, 0);
        }

        #[tokio::test]
        async fn full_queue_rolls_back_the_upload() {
            let dir = tempfile::tempdir().unwrap();
            let (manager, _rx) = manager_in(&dir, 1).await;

            let first = manager.submit(None, PDF).await.unwrap();
            let err = manager.submit(None, PDF).await.unwrap_err();
            assert!(matches!(err, PagemillError::Busy(_)));

            // Only the accepted job is visible.
            let listed = manager.list();
            assert_eq!(listed.len(), 1);
            assert_eq!(listed[0].job_id, first);
        }

        #[tokio::test]
        async fn cancel_while_queued_fails_the_job_and_purges() {
            let dir = tempfile::tempdir().unwrap();
            let (manager, _rx) = manager_in(&dir, 8).await;

            let id = manager.submit(None, PDF).await.unwrap();
            let upload = dir.path().join("temp_uploads").join(format!("{id}.pdf"));
            assert!(upload.exists());

            manager.cancel(id).await.unwrap();

            let status = manager.status(id).unwrap();
            assert_eq!(status.state, JobState::Failed);
            assert_eq!(status.error.as_deref(), Some(CANCELLED_REASON));
            assert!(!upload.exists());
        }

        #[tokio::test]
        async fn result_before_completion_is_not_ready() {
            let dir = tempfile::tempdir().unwrap();
            let (manager, _rx) = manager_in(&dir, 8).await;

            let id = manager.submit(None, PDF).await.unwrap();
            let err = manager.result(id).unwrap_err();
            assert!(matches!(err, PagemillError::NotReady { .. }));
        }

        #[tokio::test]
        async fn unknown_ids_are_not_found_everywhere() {
            let dir = tempfile::tempdir().unwrap();
            let (manager, _rx) = manager_in(&dir, 8).await;
            let ghost = Uuid::new_v4();

            assert!(matches!(
                manager.status(ghost).unwrap_err(),
                PagemillError::NotFound(_)
            ));
            assert!(matches!(
                manager.result(ghost).unwrap_err(),
                PagemillError::NotFound(_)
            ));
            assert!(matches!(
                manager.cancel(ghost).await.unwrap_err(),
                PagemillError::NotFound(_)
            ));
        }
    }
}
