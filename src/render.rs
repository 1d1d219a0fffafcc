//! Page rendering: the capability seam between the Conversion Engine and
//! pdfium.
//!
//! ## Why a trait?
//!
//! Everything above this module (engine, workers, HTTP tests) only needs
//! "turn a document into an ordered stream of page images". Hiding pdfium
//! behind [`PageRenderer`] lets tests script success, partial output, and
//! failure without a rendering backend installed, and keeps the retry policy
//! honest: it reacts to [`RenderError`] classifications, not to pdfium
//! internals.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which is CPU-bound
//! and not safe to drive from async contexts. The production renderer runs the
//! whole document on a blocking-pool thread and hands pages back through a
//! small bounded channel, so a 500-page document never buffers more than a
//! couple of pages in memory.

use std::io::Cursor;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use image::ImageFormat;
use pdfium_render::prelude::*;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::config::ServiceConfig;
use crate::error::RenderError;

/// Options controlling rasterisation.
#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    /// Target resolution in DPI.
    pub dpi: u32,
    /// Cap on the longer rendered dimension, in pixels.
    pub max_page_pixels: u32,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            dpi: 150,
            max_page_pixels: 10_000,
        }
    }
}

impl From<&ServiceConfig> for RenderOptions {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            dpi: config.dpi,
            max_page_pixels: config.max_page_pixels,
        }
    }
}

/// One rendered page: 0-based index plus encoded PNG bytes.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub index: u32,
    pub png: Vec<u8>,
}

/// A boxed stream of rendered pages, emitted in increasing index order.
pub type PageStream = Pin<Box<dyn Stream<Item = Result<RenderedPage, RenderError>> + Send>>;

/// The page-rendering capability.
///
/// Implementations must emit pages in strictly increasing index order
/// starting at 0. Faults may surface either as an `Err` from [`render`]
/// (could not start at all) or as an `Err` item mid-stream (document opened
/// but a page failed); callers handle both identically.
///
/// [`render`]: PageRenderer::render
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(
        &self,
        document: &Path,
        options: RenderOptions,
    ) -> Result<PageStream, RenderError>;
}

/// Production renderer backed by pdfium.
///
/// Binding happens per render call: pdfium keeps thread-local state, and each
/// call already owns a whole blocking-pool thread for the document's
/// lifetime, so there is nothing to share.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfiumRenderer;

impl PdfiumRenderer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PageRenderer for PdfiumRenderer {
    async fn render(
        &self,
        document: &Path,
        options: RenderOptions,
    ) -> Result<PageStream, RenderError> {
        // Capacity 2: the blocking thread renders at most one page ahead of
        // the consumer.
        let (tx, rx) = mpsc::channel::<Result<RenderedPage, RenderError>>(2);
        let path = document.to_path_buf();
        tokio::task::spawn_blocking(move || {
            run_render_task(tx, |tx| render_blocking(&path, options, tx));
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Run a blocking render body, forwarding any fault into the channel.
///
/// The pdfium bindings call into C++ and can panic on malformed documents. A
/// panic here is caught and forwarded as [`RenderError::Interrupted`] rather
/// than letting the channel close and pass for a clean end of document.
fn run_render_task<F>(tx: mpsc::Sender<Result<RenderedPage, RenderError>>, body: F)
where
    F: FnOnce(&mpsc::Sender<Result<RenderedPage, RenderError>>) -> Result<(), RenderError>,
{
    match std::panic::catch_unwind(AssertUnwindSafe(|| body(&tx))) {
        Ok(Ok(())) => {}
        Ok(Err(fault)) => {
            let _ = tx.blocking_send(Err(fault));
        }
        Err(cause) => {
            let detail = cause
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| cause.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "render task panicked".to_string());
            let _ = tx.blocking_send(Err(RenderError::Interrupted { detail }));
        }
    }
}

/// Render every page of `path`, pushing results into `tx`.
///
/// Returns early (Ok) when the receiver is dropped: that is the caller
/// abandoning the stream, not a fault.
fn render_blocking(
    path: &Path,
    options: RenderOptions,
    tx: &mpsc::Sender<Result<RenderedPage, RenderError>>,
) -> Result<(), RenderError> {
    let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| Pdfium::bind_to_system_library())
        .map_err(|e| RenderError::Unavailable {
            detail: format!("{e:?}"),
        })?;
    let pdfium = Pdfium::new(bindings);

    let document = pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| RenderError::Open {
            detail: format!("{e:?}"),
        })?;

    let pages = document.pages();
    let page_count = pages.len();
    if page_count == 0 {
        return Err(RenderError::EmptyDocument);
    }
    debug!(pages = page_count, path = %path.display(), "document loaded");

    for index in 0..page_count {
        if tx.is_closed() {
            return Ok(());
        }

        let page = pages.get(index).map_err(|e| RenderError::Page {
            index: index as u32,
            detail: format!("{e:?}"),
        })?;

        let width_px = target_width(page.width().value, options);
        let render_config = PdfRenderConfig::new()
            .set_target_width(width_px as i32)
            .set_maximum_height(options.max_page_pixels as i32);

        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| RenderError::Page {
                index: index as u32,
                detail: format!("{e:?}"),
            })?;
        let image = bitmap.as_image();

        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| RenderError::Page {
                index: index as u32,
                detail: e.to_string(),
            })?;
        debug!(
            page = index,
            width = image.width(),
            height = image.height(),
            bytes = png.len(),
            "page rendered"
        );

        if tx
            .blocking_send(Ok(RenderedPage {
                index: index as u32,
                png,
            }))
            .is_err()
        {
            return Ok(());
        }
    }

    Ok(())
}

/// Pixel width for a page of `width_points` at the configured DPI, capped at
/// `max_page_pixels`. PDF points are 1/72 inch.
fn target_width(width_points: f32, options: RenderOptions) -> u32 {
    let px = (width_points * options.dpi as f32 / 72.0).round() as u32;
    px.clamp(1, options.max_page_pixels)
}
