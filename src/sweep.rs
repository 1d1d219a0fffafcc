//! Retention sweeper: a background loop that reclaims expired artifacts and
//! evicts stale terminal job records.
//!
//! Sweeping is deliberately best-effort. Anything it cannot remove this
//! round is still expired next round, so failures are logged and forgotten.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::jobs::JobManager;

/// Spawn the sweep loop on the configured interval.
///
/// The first sweep runs right after startup, so a restarted service reclaims
/// whatever expired while it was down. Retention cutoffs key off file mtimes,
/// which keeps fresh artifacts out of reach of that initial pass.
pub fn spawn_sweeper(manager: Arc<JobManager>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(manager.config().sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            run_sweep(&manager).await;
        }
    })
}

/// One sweep round: expired disk artifacts first, then registry eviction.
pub async fn run_sweep(manager: &JobManager) {
    let config = manager.config();
    let stats = manager
        .store()
        .sweep_expired(
            config.upload_retention,
            config.image_retention,
            config.result_retention,
        )
        .await;

    // Records go when their results do, so a status poll never points at a
    // bundle the sweep already removed.
    let evicted = match chrono::Duration::from_std(config.result_retention) {
        Ok(retention) => manager.registry().evict_terminal_before(Utc::now() - retention),
        Err(err) => {
            warn!(error = %err, "result retention exceeds representable range; skipping eviction");
            0
        }
    };

    info!(
        uploads = stats.uploads_removed,
        images = stats.images_removed,
        results = stats.results_removed,
        records = evicted,
        "retention sweep finished"
    );
}
