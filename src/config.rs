//! Configuration types for the conversion service.
//!
//! All service behaviour is controlled through [`ServiceConfig`], built via
//! its [`ServiceConfigBuilder`]. One struct is shared across the store, the
//! worker pool, and the HTTP layer; the builder clamps and validates so the
//! rest of the crate can trust the values it reads.

use crate::error::PagemillError;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the conversion service.
///
/// Built via [`ServiceConfig::builder()`] or using
/// [`ServiceConfig::default()`].
///
/// # Example
/// ```rust
/// use pagemill::ServiceConfig;
///
/// let config = ServiceConfig::builder()
///     .data_dir("/var/lib/pagemill")
///     .workers(2)
///     .dpi(200)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Root directory for all on-disk state. Default: `./data`.
    ///
    /// The three artifact areas (`temp_uploads/`, `converted_images/`,
    /// `results/`) are created beneath it on startup.
    pub data_dir: PathBuf,

    /// Number of conversion workers. Default: `min(num_cpus, 4)`. Range: 1–32.
    ///
    /// Each worker drives at most one rendering call at a time, so this is
    /// also the cap on concurrent pdfium invocations. Rendering is CPU- and
    /// memory-bound; more workers than cores buys nothing but contention.
    pub workers: usize,

    /// Capacity of the FIFO job queue. Default: 1000.
    ///
    /// `submit` fails once the queue is full rather than buffering without
    /// bound. A thousand pending documents is far past the point where an
    /// operator should be adding capacity instead.
    pub queue_capacity: usize,

    /// Maximum accepted upload size in bytes. Default: 50 MiB.
    ///
    /// Enforced by the HTTP body limit before any disk write happens.
    pub max_upload_bytes: usize,

    /// Rendering resolution in DPI. Default: 150. Range: 36–600.
    ///
    /// 150 DPI keeps text legible while page PNGs stay small enough to
    /// bundle by the hundred. Raise it for small-font documents; lower it
    /// when conversion throughput matters more than pixel density.
    pub dpi: u32,

    /// Maximum rendered dimension (width or height) in pixels. Default: 10000.
    ///
    /// A safety cap independent of DPI: a 600-DPI render of an A0 poster
    /// would otherwise allocate gigabytes of pixels. The longer edge is
    /// clamped and the other scales proportionally.
    pub max_page_pixels: u32,

    /// Total attempts for a job whose renderer fault is transient. Default: 3.
    ///
    /// Deterministic faults (corrupt document, zero pages) are never
    /// retried; see [`crate::error::RenderError::is_transient`].
    pub max_render_attempts: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    ///
    /// Doubles after each attempt: 500 ms → 1 s → 2 s.
    pub retry_backoff_ms: u64,

    /// How often the retention sweeper runs. Default: 6 hours.
    pub sweep_interval: Duration,

    /// How long uploaded source documents are kept. Default: 24 hours.
    pub upload_retention: Duration,

    /// How long intermediate page images are kept. Default: 72 hours.
    pub image_retention: Duration,

    /// How long result bundles are kept. Default: 72 hours.
    ///
    /// Also bounds how long terminal job records stay in the in-memory
    /// registry: once a job's result has expired on disk there is nothing
    /// left to poll for.
    pub result_retention: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            workers: num_cpus::get().min(4),
            queue_capacity: 1000,
            max_upload_bytes: 50 * 1024 * 1024,
            dpi: 150,
            max_page_pixels: 10_000,
            max_render_attempts: 3,
            retry_backoff_ms: 500,
            sweep_interval: Duration::from_secs(6 * 3600),
            upload_retention: Duration::from_secs(24 * 3600),
            image_retention: Duration::from_secs(72 * 3600),
            result_retention: Duration::from_secs(72 * 3600),
        }
    }
}

impl ServiceConfig {
    /// Create a new builder for `ServiceConfig`.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder {
            config: Self::default(),
        }
    }

    /// Directory holding uploaded source documents.
    pub fn upload_dir(&self) -> PathBuf {
        self.data_dir.join("temp_uploads")
    }

    /// Directory holding intermediate page images, one subdirectory per job.
    pub fn image_dir(&self) -> PathBuf {
        self.data_dir.join("converted_images")
    }

    /// Directory holding finalized result bundles.
    pub fn result_dir(&self) -> PathBuf {
        self.data_dir.join("results")
    }
}

/// Builder for [`ServiceConfig`].
#[derive(Debug)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.config.workers = n.clamp(1, 32);
        self
    }

    pub fn queue_capacity(mut self, n: usize) -> Self {
        self.config.queue_capacity = n.clamp(1, 100_000);
        self
    }

    pub fn max_upload_bytes(mut self, n: usize) -> Self {
        self.config.max_upload_bytes = n.max(1);
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(36, 600);
        self
    }

    pub fn max_page_pixels(mut self, px: u32) -> Self {
        self.config.max_page_pixels = px.clamp(256, 20_000);
        self
    }

    pub fn max_render_attempts(mut self, n: u32) -> Self {
        self.config.max_render_attempts = n.clamp(1, 10);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    pub fn upload_retention(mut self, retention: Duration) -> Self {
        self.config.upload_retention = retention;
        self
    }

    pub fn image_retention(mut self, retention: Duration) -> Self {
        self.config.image_retention = retention;
        self
    }

    pub fn result_retention(mut self, retention: Duration) -> Self {
        self.config.result_retention = retention;
        self
    }

    /// Build the configuration, validating constraints.
    ///
    /// The setters already clamp; `build` re-validates so configs assembled
    /// by struct literal fail loudly instead of misbehaving quietly.
    pub fn build(self) -> Result<ServiceConfig, PagemillError> {
        let c = &self.config;
        if c.dpi < 36 || c.dpi > 600 {
            return Err(PagemillError::InvalidConfig(format!(
                "DPI must be 36-600, got {}",
                c.dpi
            )));
        }
        if c.workers == 0 {
            return Err(PagemillError::InvalidConfig("workers must be >= 1".into()));
        }
        if c.queue_capacity == 0 {
            return Err(PagemillError::InvalidConfig(
                "queue capacity must be >= 1".into(),
            ));
        }
        if c.data_dir.as_os_str().is_empty() {
            return Err(PagemillError::InvalidConfig("data_dir is empty".into()));
        }
        Ok(self.config)
    }
}
