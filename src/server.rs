//! HTTP ingress: the REST surface over the [`JobManager`].
//!
//! | Method | Path                | Purpose                              |
//! |--------|---------------------|--------------------------------------|
//! | POST   | `/jobs`             | multipart upload, answers 202        |
//! | GET    | `/jobs`             | all jobs, newest first               |
//! | GET    | `/jobs/:id`         | status snapshot                      |
//! | GET    | `/jobs/:id/result`  | finished bundle as `application/zip` |
//! | DELETE | `/jobs/:id`         | cancel and purge, answers 204        |
//! | GET    | `/health`           | liveness plus registry counters      |
//!
//! Errors leave as JSON `{"error": code, "message": text}` with the status
//! code derived from the error class, so clients can branch on either.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::PagemillError;
use crate::jobs::{JobCounts, JobManager, JobState, JobStatus};

/// Shared handler state. Cheap to clone; everything lives behind the
/// manager's `Arc`.
#[derive(Clone)]
pub struct AppState {
    manager: Arc<JobManager>,
}

impl AppState {
    pub fn new(manager: Arc<JobManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &JobManager {
        &self.manager
    }
}

/// Build the service router.
pub fn router(manager: Arc<JobManager>) -> Router {
    let max_upload = manager.config().max_upload_bytes;
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route(
            "/jobs",
            post(submit_job)
                .get(list_jobs)
                .layer(DefaultBodyLimit::max(max_upload)),
        )
        .route("/jobs/:id", get(job_status).delete(cancel_job))
        .route("/jobs/:id/result", get(job_result))
        .with_state(AppState::new(manager))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Bind `addr` and serve until the process exits.
pub async fn serve(manager: Arc<JobManager>, addr: SocketAddr) -> Result<(), PagemillError> {
    let app = router(manager);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| PagemillError::Internal(format!("failed to bind {addr}: {e}")))?;
    info!("listening on http://{addr}");
    axum::serve(listener, app)
        .await
        .map_err(|e| PagemillError::Internal(format!("server error: {e}")))
}

// ── Handlers ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct SubmitResponse {
    job_id: Uuid,
    state: JobState,
}

/// POST /jobs: take the first file field of the multipart body.
async fn submit_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, PagemillError> {
    let mut upload: Option<(Option<String>, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| PagemillError::invalid_input(format!("malformed multipart body: {e}")))?
    {
        let is_file = field.file_name().is_some() || field.name() == Some("file");
        if !is_file {
            continue;
        }
        let filename = field.file_name().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| PagemillError::invalid_input(format!("could not read upload: {e}")))?;
        upload = Some((filename, bytes.to_vec()));
        break;
    }

    let Some((filename, bytes)) = upload else {
        return Err(PagemillError::invalid_input("no file field in upload"));
    };

    let job_id = state.manager().submit(filename.as_deref(), &bytes).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id,
            state: JobState::Queued,
        }),
    )
        .into_response())
}

/// A path id that does not parse as a UUID cannot name any job; it gets the
/// same 404 an unknown id does.
fn parse_job_id(raw: &str) -> Result<Uuid, PagemillError> {
    Uuid::parse_str(raw).map_err(|_| PagemillError::NotFound(raw.to_string()))
}

/// GET /jobs/:id
async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobStatus>, PagemillError> {
    let id = parse_job_id(&id)?;
    Ok(Json(state.manager().status(id)?))
}

#[derive(Debug, Serialize)]
struct JobListResponse {
    jobs: Vec<JobStatus>,
    counts: JobCounts,
}

/// GET /jobs
async fn list_jobs(State(state): State<AppState>) -> Json<JobListResponse> {
    Json(JobListResponse {
        jobs: state.manager().list(),
        counts: state.manager().counts(),
    })
}

/// GET /jobs/:id/result: the ZIP bundle for a completed job, streamed from
/// disk. Bundles hold uncompressed PNGs and can run to hundreds of megabytes.
async fn job_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, PagemillError> {
    let id = parse_job_id(&id)?;
    let artifact = state.manager().result(id)?;
    let file = tokio::fs::File::open(&artifact.path)
        .await
        .map_err(|e| PagemillError::io(&artifact.path, e))?;
    let length = file
        .metadata()
        .await
        .map_err(|e| PagemillError::io(&artifact.path, e))?
        .len();

    let headers = [
        (header::CONTENT_TYPE, "application/zip".to_string()),
        (header::CONTENT_LENGTH, length.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{id}.zip\""),
        ),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}

/// DELETE /jobs/:id
async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, PagemillError> {
    let id = parse_job_id(&id)?;
    state.manager().cancel(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    name: &'static str,
    version: &'static str,
    workers: usize,
    total_jobs: usize,
    jobs: JobCounts,
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let counts = state.manager().counts();
    Json(HealthResponse {
        status: "ok",
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        workers: state.manager().config().workers,
        total_jobs: counts.total(),
        jobs: counts,
    })
}

// ── Error mapping ───────────────────────────────────────────────────────────

fn classify(err: &PagemillError) -> (StatusCode, &'static str) {
    match err {
        PagemillError::InvalidInput { .. } => (StatusCode::BAD_REQUEST, "invalid_input"),
        PagemillError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        PagemillError::NotReady { .. } => (StatusCode::CONFLICT, "not_ready"),
        PagemillError::Busy(_) => (StatusCode::SERVICE_UNAVAILABLE, "busy"),
        PagemillError::Io { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "io_fault"),
        PagemillError::Conversion(_) => (StatusCode::INTERNAL_SERVER_ERROR, "conversion_fault"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    }
}

impl IntoResponse for PagemillError {
    fn into_response(self) -> Response {
        let (status, code) = classify(&self);
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (
            status,
            Json(json!({
                "error": code,
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RenderError;

    #[test]
    fn error_classes_map_to_expected_statuses() {
        let id = Uuid::new_v4();
        let cases: Vec<(PagemillError, StatusCode)> = vec![
            (
                PagemillError::invalid_input("bad"),
                StatusCode::BAD_REQUEST,
            ),
            (
                PagemillError::NotFound(id.to_string()),
                StatusCode::NOT_FOUND,
            ),
            (
                PagemillError::NotReady {
                    job: id,
                    detail: "job is queued".into(),
                },
                StatusCode::CONFLICT,
            ),
            (
                PagemillError::Busy("queue full".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                PagemillError::Conversion(RenderError::EmptyDocument),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                PagemillError::Internal("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            let (status, _) = classify(&err);
            assert_eq!(status, expected, "wrong status for {err}");
        }
    }

    #[test]
    fn error_body_carries_code_and_message() {
        let response = PagemillError::invalid_input("empty upload").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn job_ids_that_are_not_uuids_read_as_unknown() {
        let err = parse_job_id("not-a-uuid").unwrap_err();
        assert!(matches!(&err, PagemillError::NotFound(raw) if raw == "not-a-uuid"));
        assert_eq!(classify(&err).0, StatusCode::NOT_FOUND);

        let id = Uuid::new_v4();
        assert_eq!(parse_job_id(&id.to_string()).unwrap(), id);
    }
}
