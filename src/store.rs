//! Artifact Store: per-job files under three on-disk areas.
//!
//! ```text
//! <data_dir>/
//!  ├─ temp_uploads/       <job_id>.pdf           incoming documents
//!  ├─ converted_images/   <job_id>/page_NNNN.png rendered pages
//!  └─ results/            <job_id>.zip           finalized bundles
//! ```
//!
//! Every write goes through a temporary sibling path that is flushed and then
//! renamed into place, so a crash mid-write never leaves a partial file under
//! a final name. Page indices are validated against the files already on disk:
//! the store, not its callers, is the authority on contiguity.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::error::PagemillError;

/// Role of an artifact within a job's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactRole {
    /// The uploaded source document.
    Upload,
    /// One rendered page image.
    PageImage,
    /// The finalized result bundle.
    ResultBundle,
}

/// Handle to a stored artifact, returned by every write operation.
///
/// Callers hold these instead of raw paths; the path inside is only ever
/// produced by the store.
#[derive(Debug, Clone)]
pub struct ArtifactRef {
    pub job: Uuid,
    pub role: ArtifactRole,
    pub path: PathBuf,
}

/// Counters reported by one retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub uploads_removed: usize,
    pub images_removed: usize,
    pub results_removed: usize,
}

impl SweepStats {
    pub fn total(&self) -> usize {
        self.uploads_removed + self.images_removed + self.results_removed
    }
}

/// On-disk storage for per-job artifacts.
pub struct ArtifactStore {
    uploads: PathBuf,
    images: PathBuf,
    results: PathBuf,
}

impl ArtifactStore {
    /// Open the store, creating the three area directories if missing.
    pub fn open(config: &ServiceConfig) -> Result<Self, PagemillError> {
        let store = Self {
            uploads: config.upload_dir(),
            images: config.image_dir(),
            results: config.result_dir(),
        };
        for dir in [&store.uploads, &store.images, &store.results] {
            std::fs::create_dir_all(dir).map_err(|e| PagemillError::io(dir, e))?;
        }
        Ok(store)
    }

    // ── Write operations ─────────────────────────────────────────────────

    /// Persist an uploaded document. Rejects zero-byte input.
    pub async fn save_upload(
        &self,
        job: Uuid,
        bytes: &[u8],
    ) -> Result<ArtifactRef, PagemillError> {
        if bytes.is_empty() {
            return Err(PagemillError::invalid_input("upload is empty"));
        }
        let path = self.uploads.join(format!("{job}.pdf"));
        write_atomic(&path, bytes).await?;
        tracing::debug!(%job, bytes = bytes.len(), "upload saved");
        Ok(ArtifactRef {
            job,
            role: ArtifactRole::Upload,
            path,
        })
    }

    /// Store one rendered page. Indices must be contiguous starting at 0.
    pub async fn write_page_image(
        &self,
        job: Uuid,
        index: u32,
        bytes: &[u8],
    ) -> Result<ArtifactRef, PagemillError> {
        let dir = self.images.join(job.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| PagemillError::io(&dir, e))?;

        let expected = page_files(&dir).await?.len() as u32;
        if index != expected {
            return Err(PagemillError::OrderingViolation {
                job,
                expected,
                found: index,
            });
        }

        let path = dir.join(page_file_name(index));
        write_atomic(&path, bytes).await?;
        Ok(ArtifactRef {
            job,
            role: ArtifactRole::PageImage,
            path,
        })
    }

    /// Package all page images for a job into a ZIP bundle.
    ///
    /// Fails with `NotReady` when no pages exist. The bundle lists pages in
    /// index order under their on-disk names (`page_0000.png`, …).
    pub async fn finalize_result(&self, job: Uuid) -> Result<ArtifactRef, PagemillError> {
        let dir = self.images.join(job.to_string());
        let pages = page_files(&dir).await?;
        if pages.is_empty() {
            return Err(PagemillError::NotReady {
                job,
                detail: "no page images have been produced".into(),
            });
        }

        let path = self.results.join(format!("{job}.zip"));
        let tmp = tmp_sibling(&path);
        let bundle_tmp = tmp.clone();
        // The zip writer is synchronous; keep it off the async executor the
        // same way the renderer is.
        let result = async {
            tokio::task::spawn_blocking(move || build_bundle(&bundle_tmp, &pages))
                .await
                .map_err(|e| PagemillError::Internal(format!("bundle task failed: {e}")))??;
            tokio::fs::rename(&tmp, &path)
                .await
                .map_err(|e| PagemillError::io(&path, e))
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        result?;

        tracing::debug!(%job, path = %path.display(), "result bundle finalized");
        Ok(ArtifactRef {
            job,
            role: ArtifactRole::ResultBundle,
            path,
        })
    }

    // ── Cleanup operations ───────────────────────────────────────────────

    /// Delete every artifact belonging to a job.
    ///
    /// Idempotent: purging a job with no artifacts succeeds.
    pub async fn purge(&self, job: Uuid) -> Result<(), PagemillError> {
        remove_file_if_exists(&self.uploads.join(format!("{job}.pdf"))).await?;
        remove_dir_if_exists(&self.images.join(job.to_string())).await?;
        remove_file_if_exists(&self.results.join(format!("{job}.zip"))).await?;
        Ok(())
    }

    /// Delete intermediate page images only, leaving the upload in place.
    ///
    /// Used between conversion retry attempts so the next attempt starts
    /// from index 0 against a clean directory.
    pub async fn discard_pages(&self, job: Uuid) -> Result<(), PagemillError> {
        remove_dir_if_exists(&self.images.join(job.to_string())).await
    }

    /// Delete artifacts older than the per-area retention windows.
    ///
    /// Best-effort: individual failures are logged and skipped, never raised.
    pub async fn sweep_expired(
        &self,
        upload_retention: Duration,
        image_retention: Duration,
        result_retention: Duration,
    ) -> SweepStats {
        SweepStats {
            uploads_removed: sweep_area(&self.uploads, upload_retention).await,
            images_removed: sweep_area(&self.images, image_retention).await,
            results_removed: sweep_area(&self.results, result_retention).await,
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn page_file_name(index: u32) -> String {
    format!("page_{index:04}.png")
}

/// Page image paths for a job, sorted by page index.
///
/// Sorted numerically on the parsed index, not lexically, so documents past
/// 9999 pages still come back in order.
async fn page_files(dir: &Path) -> Result<Vec<PathBuf>, PagemillError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PagemillError::io(dir, e)),
    };

    let mut pages: Vec<(u32, PathBuf)> = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| PagemillError::io(dir, e))?
    {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(index) = parse_page_index(name) {
            pages.push((index, entry.path()));
        }
    }
    pages.sort_unstable_by_key(|(index, _)| *index);
    Ok(pages.into_iter().map(|(_, path)| path).collect())
}

fn parse_page_index(file_name: &str) -> Option<u32> {
    file_name
        .strip_prefix("page_")?
        .strip_suffix(".png")?
        .parse()
        .ok()
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Write bytes to `path` via a flushed temporary sibling plus rename.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PagemillError> {
    use tokio::io::AsyncWriteExt;

    let tmp = tmp_sibling(path);
    let result = async {
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| PagemillError::io(&tmp, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| PagemillError::io(&tmp, e))?;
        file.sync_all()
            .await
            .map_err(|e| PagemillError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| PagemillError::io(path, e))
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

fn build_bundle(path: &Path, pages: &[PathBuf]) -> Result<(), PagemillError> {
    use zip::write::SimpleFileOptions;

    let file = std::fs::File::create(path).map_err(|e| PagemillError::io(path, e))?;
    let mut bundle = zip::ZipWriter::new(file);
    // Page PNGs are already compressed; recompressing buys nothing.
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);

    for page in pages {
        let name = page
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PagemillError::Internal(format!("unnameable page: {page:?}")))?;
        bundle
            .start_file(name, options)
            .map_err(|e| PagemillError::Internal(format!("bundle entry '{name}': {e}")))?;
        let mut src = std::fs::File::open(page).map_err(|e| PagemillError::io(page, e))?;
        std::io::copy(&mut src, &mut bundle).map_err(|e| PagemillError::io(page, e))?;
    }

    let file = bundle
        .finish()
        .map_err(|e| PagemillError::Internal(format!("bundle finish: {e}")))?;
    file.sync_all().map_err(|e| PagemillError::io(path, e))
}

async fn remove_file_if_exists(path: &Path) -> Result<(), PagemillError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PagemillError::io(path, e)),
    }
}

async fn remove_dir_if_exists(path: &Path) -> Result<(), PagemillError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PagemillError::io(path, e)),
    }
}

/// Remove direct children of `area` whose mtime is older than `retention`.
/// Returns the number of entries removed.
async fn sweep_area(area: &Path, retention: Duration) -> usize {
    let cutoff = SystemTime::now() - retention;
    let mut entries = match tokio::fs::read_dir(area).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(area = %area.display(), error = %e, "sweep: cannot read area");
            return 0;
        }
    };

    let mut removed = 0;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(area = %area.display(), error = %e, "sweep: listing failed");
                break;
            }
        };
        let path = entry.path();
        // Skip half-written temporaries younger than the cutoff; expired ones
        // are stale leftovers and go too.
        let modified = match entry.metadata().await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "sweep: no mtime");
                continue;
            }
        };
        if modified > cutoff {
            continue;
        }
        let result = if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "sweep: removal failed")
            }
        }
    }
    removed
}
