//! The Conversion Engine: drives a [`PageRenderer`] and hands finished pages
//! to a [`PageSink`] one at a time, in index order.
//!
//! The engine owns the ordering and cancellation rules so that neither the
//! renderer nor the sink has to be trusted with them:
//!
//! * pages reach the sink in strictly increasing index order starting at 0,
//!   or the conversion fails with an ordering violation;
//! * the cancel token is consulted at every page boundary, never mid-page;
//! * a document that produces zero pages is a conversion fault, not an empty
//!   success.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::debug;
use uuid::Uuid;

use crate::error::{PagemillError, RenderError};
use crate::jobs::CancelToken;
use crate::render::{PageRenderer, RenderOptions, RenderedPage};

/// Receives pages as the engine produces them.
///
/// `accept` is called exactly once per page, in index order. Returning an
/// error aborts the conversion; pages already accepted stay wherever the sink
/// put them and the caller decides what to do with the partial output.
#[async_trait]
pub trait PageSink: Send {
    async fn accept(&mut self, page: &RenderedPage) -> Result<(), PagemillError>;
}

/// Converts one document at a time via the configured renderer.
pub struct ConversionEngine {
    renderer: Arc<dyn PageRenderer>,
    options: RenderOptions,
}

impl ConversionEngine {
    pub fn new(renderer: Arc<dyn PageRenderer>, options: RenderOptions) -> Self {
        Self { renderer, options }
    }

    /// Render `document` and push every page into `sink`.
    ///
    /// Returns the number of pages delivered. `job` is carried for
    /// diagnostics only; the engine holds no job state.
    pub async fn convert(
        &self,
        job: Uuid,
        document: &Path,
        cancel: &CancelToken,
        sink: &mut dyn PageSink,
    ) -> Result<u32, PagemillError> {
        if cancel.is_cancelled() {
            return Err(PagemillError::Cancelled);
        }

        let mut pages = self.renderer.render(document, self.options).await?;
        let mut delivered: u32 = 0;

        // Dropping `pages` on any early return tells the renderer to stop.
        while let Some(item) = pages.next().await {
            if cancel.is_cancelled() {
                debug!(%job, after_pages = delivered, "conversion cancelled");
                return Err(PagemillError::Cancelled);
            }

            let page = item?;
            if page.index != delivered {
                return Err(PagemillError::OrderingViolation {
                    job,
                    expected: delivered,
                    found: page.index,
                });
            }

            sink.accept(&page).await?;
            delivered += 1;
        }

        if delivered == 0 {
            return Err(RenderError::EmptyDocument.into());
        }
        debug!(%job, pages = delivered, "conversion finished");
        Ok(delivered)
    }
}
