//! Orphan reconciliation: a `running` row whose broker lock is gone means
//! its worker died mid-run. Such rows go back to `pending` so another
//! worker can claim them; the attempt cap is enforced at claim time.

use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use arbor_broker::CancelSignal;
use arbor_db::runs;

use crate::worker::WorkerDeps;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub async fn run(deps: WorkerDeps, shutdown: CancelSignal) {
    loop {
        // Jitter so multiple processes don't sweep in lockstep.
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..Duration::from_secs(5));
        tokio::select! {
            _ = tokio::time::sleep(SWEEP_INTERVAL + jitter) => {}
            _ = shutdown.aborted() => return,
        }

        if let Err(err) = sweep_once(&deps).await {
            warn!(%err, "sweep pass failed");
        }
    }
}

/// One reconciliation pass. Public so scenario tests can drive it without
/// waiting out the interval.
pub async fn sweep_once(deps: &WorkerDeps) -> arbor_db::error::Result<usize> {
    let mut requeued = 0usize;
    for run in runs::list_running(&deps.pool).await? {
        if deps.broker.is_locked(run.run_id).await {
            continue;
        }
        if runs::requeue(&deps.pool, run.run_id).await? {
            info!(run_id = %run.run_id, attempt = run.attempt(), "requeued orphaned run");
            requeued += 1;
        }
    }
    Ok(requeued)
}
