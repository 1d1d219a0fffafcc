//! Error types for the pagemill library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PagemillError`]: the service-level taxonomy. Storage faults, invariant
//!   violations, unknown identifiers, and wrapped conversion faults. Returned
//!   from the Artifact Store, the Job Manager, and the Conversion Engine.
//!
//! * [`RenderError`]: a renderer-level fault raised by a [`crate::render::PageRenderer`]
//!   implementation. Carries the backend's diagnostic text plus a
//!   transient-vs-deterministic classification that the worker's retry policy
//!   consumes (see [`RenderError::is_transient`]).
//!
//! The separation keeps retry knowledge where it belongs: a renderer knows
//! *why* it failed, the Job Manager decides *whether that is worth retrying*.

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// All errors returned by the pagemill library.
///
/// Renderer-level failures use [`RenderError`] and arrive here wrapped in
/// [`PagemillError::Conversion`].
#[derive(Debug, Error)]
pub enum PagemillError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The uploaded document was rejected before a job was created.
    ///
    /// User-caused and never retried: empty payloads, missing multipart file
    /// fields, and payloads without a PDF magic prefix all land here.
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    // ── Storage errors ────────────────────────────────────────────────────
    /// A disk read/write failed inside the Artifact Store.
    ///
    /// Retried once by the worker before the job is marked failed.
    #[error("I/O fault at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Conversion errors ─────────────────────────────────────────────────
    /// The renderer failed; the inner fault says whether a retry is sensible.
    #[error("conversion fault: {0}")]
    Conversion(#[from] RenderError),

    // ── Invariant violations ──────────────────────────────────────────────
    /// A page image arrived out of order.
    ///
    /// Page indices must be contiguous from 0. A defect in the renderer or
    /// engine, not environmental flakiness; never retried.
    #[error("ordering violation for job {job}: expected page index {expected}, got {found}")]
    OrderingViolation { job: Uuid, expected: u32, found: u32 },

    /// A result was requested before one exists.
    ///
    /// Raised by `finalize_result` on a job with zero pages, and surfaced to
    /// HTTP callers as `409 Conflict` when they fetch a result early.
    #[error("result for job {job} is not ready: {detail}")]
    NotReady { job: Uuid, detail: String },

    // ── Lookup errors ─────────────────────────────────────────────────────
    /// No job with this identifier is tracked.
    ///
    /// Carries the identifier as the caller spelled it, so a path segment
    /// that is not even a UUID reads back verbatim in the message.
    #[error("job {0} not found")]
    NotFound(String),

    // ── Lifecycle ─────────────────────────────────────────────────────────
    /// Cancellation was observed at a page boundary.
    ///
    /// The worker maps this to a terminal `Failed` state with the cancelled
    /// reason string; it never escapes the worker.
    #[error("job cancelled")]
    Cancelled,

    // ── Capacity ──────────────────────────────────────────────────────────
    /// The work queue is full. Clients may retry after a delay.
    #[error("service is busy: {0}")]
    Busy(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (closed queue channel, poisoned task, …).
    #[error("internal error: {0}")]
    Internal(String),
}

impl PagemillError {
    /// Convenience constructor for [`PagemillError::Io`].
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Convenience constructor for [`PagemillError::InvalidInput`].
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }
}

/// A fault raised by a [`crate::render::PageRenderer`] implementation.
///
/// Every variant carries diagnostic text from the rendering backend so that a
/// failed job's error detail tells the operator what actually went wrong.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    /// The rendering backend could not be reached or initialised.
    ///
    /// Typically the pdfium library failed to bind. Plausibly transient
    /// (deployment race, temporary resource exhaustion), so it is retried.
    #[error("renderer unavailable: {detail}")]
    Unavailable { detail: String },

    /// The document could not be opened or parsed.
    ///
    /// Deterministic: the same bytes will fail the same way on every attempt.
    #[error("cannot open document: {detail}")]
    Open { detail: String },

    /// A single page failed to render or encode.
    #[error("page {index} failed to render: {detail}")]
    Page { index: u32, detail: String },

    /// The document opened cleanly but contains zero pages.
    #[error("document produced zero pages")]
    EmptyDocument,

    /// The page stream was interrupted before the document finished.
    ///
    /// The blocking render task or its channel died mid-document, which is
    /// environmental rather than document-shaped, so it is retried.
    #[error("render stream interrupted: {detail}")]
    Interrupted { detail: String },
}

impl RenderError {
    /// Whether the worker's retry policy should attempt this job again.
    ///
    /// Document-shaped faults (`Open`, `Page`, `EmptyDocument`) repeat
    /// deterministically; environment-shaped faults do not.
    pub fn is_transient(&self) -> bool {
        match self {
            RenderError::Unavailable { .. } | RenderError::Interrupted { .. } => true,
            RenderError::Open { .. }
            | RenderError::Page { .. }
            | RenderError::EmptyDocument => false,
        }
    }
}
