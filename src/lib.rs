//! # pagemill
//!
//! A self-hosted document conversion service: upload a PDF over HTTP, get
//! back a ZIP of per-page PNG images.
//!
//! ## Why this crate?
//!
//! Rasterising a PDF is CPU-bound and slow; nobody wants to hold an HTTP
//! connection open while a 300-page manual renders. pagemill accepts the
//! upload, answers immediately with a job id, and converts in the background
//! on a bounded worker pool. Clients poll for status and fetch the finished
//! bundle once the job completes; artifacts age out on configurable
//! retention windows so the disk never fills with forgotten conversions.
//!
//! ## Request Lifecycle
//!
//! ```text
//! POST /jobs
//!  │
//!  ├─ 1. Validate  PDF magic + body limit, rejected before a job exists
//!  ├─ 2. Persist   upload lands in the Artifact Store, 202 + job id
//!  ├─ 3. Queue     FIFO handoff to the worker pool
//!  ├─ 4. Render    pdfium rasterises page by page (CPU-bound, spawn_blocking)
//!  ├─ 5. Bundle    page_0000.png … page_NNNN.png zipped atomically
//!  └─ 6. Fetch     GET /jobs/{id}/result serves the ZIP, 409 until done
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pagemill::{ArtifactStore, JobManager, PdfiumRenderer, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServiceConfig::default();
//!     let store = Arc::new(ArtifactStore::open(&config)?);
//!     let renderer = Arc::new(PdfiumRenderer::new());
//!
//!     let (manager, queue) = JobManager::new(config.clone(), store, renderer);
//!     pagemill::worker::spawn_workers(Arc::clone(&manager), queue, config.workers);
//!     pagemill::sweep::spawn_sweeper(Arc::clone(&manager));
//!
//!     pagemill::server::serve(manager, "0.0.0.0:8000".parse()?).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Storage Layout
//!
//! | Area               | Contents                      | Retention |
//! |--------------------|-------------------------------|-----------|
//! | `temp_uploads/`    | `{job}.pdf` source documents  | 24 h      |
//! | `converted_images/`| `{job}/page_NNNN.png` images  | 72 h      |
//! | `results/`         | `{job}.zip` finished bundles  | 72 h      |
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pagemill-server` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when embedding the library to avoid pulling in CLI-only deps:
//! ```toml
//! pagemill = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod render;
pub mod server;
pub mod store;
pub mod sweep;
pub mod worker;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ServiceConfig, ServiceConfigBuilder};
pub use engine::{ConversionEngine, PageSink};
pub use error::{PagemillError, RenderError};
pub use jobs::{CancelToken, JobCounts, JobManager, JobRegistry, JobState, JobStatus};
pub use render::{PageRenderer, PageStream, PdfiumRenderer, RenderOptions, RenderedPage};
pub use server::{router, serve, AppState};
pub use store::{ArtifactRef, ArtifactRole, ArtifactStore, SweepStats};
