//! Server binary for pagemill.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ServiceConfig` and runs the HTTP service.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use pagemill::{ArtifactStore, JobManager, PdfiumRenderer, ServiceConfig};
use tracing_subscriber::EnvFilter;

const AFTER_HELP: &str = r#"EXAMPLES:
  # Run with defaults (0.0.0.0:8000, ./data)
  pagemill-server

  # Custom port and data directory
  pagemill-server --port 9000 --data-dir /var/lib/pagemill

  # High-resolution rendering with a bigger worker pool
  pagemill-server --dpi 300 --workers 8

  # Short retention for a scratch instance
  pagemill-server --upload-retention-hours 1 --result-retention-hours 4 \
                  --sweep-interval-hours 1

ENDPOINTS:
  POST   /jobs              upload a PDF (multipart field "file"), answers 202
  GET    /jobs              list all jobs
  GET    /jobs/{id}         job status
  GET    /jobs/{id}/result  finished ZIP bundle (409 until completed)
  DELETE /jobs/{id}         cancel and purge
  GET    /health            liveness + job counters

ENVIRONMENT VARIABLES:
  Every flag can also be set via its PAGEMILL_* variable, e.g.
    PAGEMILL_PORT=9000 PAGEMILL_DATA_DIR=/srv/pagemill pagemill-server

  pdfium is loaded at render time from the working directory or the system
  library path; install libpdfium where the dynamic loader can find it.
"#;

/// Document conversion service: PDFs in, per-page PNG bundles out.
#[derive(Parser, Debug)]
#[command(
    name = "pagemill-server",
    version,
    about = "HTTP service converting PDF uploads into per-page PNG bundles",
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Address to bind.
    #[arg(long, env = "PAGEMILL_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(short, long, env = "PAGEMILL_PORT", default_value_t = 8000)]
    port: u16,

    /// Root directory for uploads, page images, and result bundles.
    #[arg(long, env = "PAGEMILL_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Conversion workers. Defaults to min(CPU count, 4).
    #[arg(long, env = "PAGEMILL_WORKERS")]
    workers: Option<usize>,

    /// Queued jobs accepted before uploads are turned away with 503.
    #[arg(long, env = "PAGEMILL_QUEUE_CAPACITY", default_value_t = 1000)]
    queue_capacity: usize,

    /// Rendering DPI (36–600).
    #[arg(long, env = "PAGEMILL_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(36..=600))]
    dpi: u32,

    /// Upload size limit in MiB (1–2048).
    #[arg(long, env = "PAGEMILL_MAX_UPLOAD_MB", default_value_t = 50,
          value_parser = clap::value_parser!(u64).range(1..=2048))]
    max_upload_mb: u64,

    /// Hours before source uploads are swept (1–8760).
    #[arg(long, env = "PAGEMILL_UPLOAD_RETENTION_HOURS", default_value_t = 24,
          value_parser = clap::value_parser!(u64).range(1..=8760))]
    upload_retention_hours: u64,

    /// Hours before page images and result bundles are swept (1–8760).
    #[arg(long, env = "PAGEMILL_RESULT_RETENTION_HOURS", default_value_t = 72,
          value_parser = clap::value_parser!(u64).range(1..=8760))]
    result_retention_hours: u64,

    /// Hours between retention sweeps (1–8760).
    #[arg(long, env = "PAGEMILL_SWEEP_INTERVAL_HOURS", default_value_t = 6,
          value_parser = clap::value_parser!(u64).range(1..=8760))]
    sweep_interval_hours: u64,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PAGEMILL_VERBOSE")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let config = build_config(&cli)?;

    // ── Wire the service ─────────────────────────────────────────────────
    let store = Arc::new(ArtifactStore::open(&config).context("Failed to open artifact store")?);
    let renderer = Arc::new(PdfiumRenderer::new());
    let (manager, queue) = JobManager::new(config.clone(), store, renderer);

    pagemill::worker::spawn_workers(Arc::clone(&manager), queue, config.workers);
    pagemill::sweep::spawn_sweeper(Arc::clone(&manager));

    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", cli.host, cli.port))?;

    tracing::info!(
        workers = config.workers,
        dpi = config.dpi,
        data_dir = %config.data_dir.display(),
        "pagemill starting"
    );

    pagemill::server::serve(manager, addr)
        .await
        .context("Server failed")?;
    Ok(())
}

/// Map CLI args to `ServiceConfig`.
fn build_config(cli: &Cli) -> Result<ServiceConfig> {
    let hours = |h: u64| Duration::from_secs(h * 3600);

    let mut builder = ServiceConfig::builder()
        .data_dir(&cli.data_dir)
        .queue_capacity(cli.queue_capacity)
        .dpi(cli.dpi)
        .max_upload_bytes(cli.max_upload_mb as usize * 1024 * 1024)
        .upload_retention(hours(cli.upload_retention_hours))
        .image_retention(hours(cli.result_retention_hours))
        .result_retention(hours(cli.result_retention_hours))
        .sweep_interval(hours(cli.sweep_interval_hours));

    if let Some(workers) = cli.workers {
        builder = builder.workers(workers);
    }

    builder.build().context("Invalid configuration")
}
