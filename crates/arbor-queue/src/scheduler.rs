//! Claim loop: walk due pending runs oldest-first, take the per-run lock,
//! re-check under it, and hand exactly one claimed run to the caller.

use sqlx::PgPool;
use tracing::debug;

use arbor_broker::{BrokerError, CancelSignal, StreamBroker};
use arbor_db::error::Result;
use arbor_db::runs;
use arbor_schemas::{Run, RunStatus};

/// How many due rows one pass inspects.
const SCAN_LIMIT: i64 = 100;

/// A run this process now owns. The broker lock (and its control
/// subscription) stays held until the worker unlocks at the end of
/// execution.
pub struct ClaimedRun {
    pub run: Run,
    pub attempt: i64,
    pub cancel: CancelSignal,
}

/// Claim the next dispatchable run, or `None` when nothing is due.
///
/// Ties break on `created_at` ascending. Losing a race is normal: the row
/// is re-checked after the lock is taken, and a row that is no longer
/// `pending` — or whose thread already has a `running` run — is skipped.
pub async fn next_run(
    pool: &PgPool,
    broker: &dyn StreamBroker,
) -> Result<Option<ClaimedRun>> {
    for run in runs::list_pending(pool, SCAN_LIMIT).await? {
        if broker.is_locked(run.run_id).await {
            continue;
        }
        let cancel = match broker.lock(run.run_id).await {
            Ok(signal) => signal,
            Err(BrokerError::AlreadyLocked(_)) => continue,
            Err(err) => return Err(err.into()),
        };

        match try_claim(pool, &run).await {
            Ok(Some(attempt)) => {
                debug!(run_id = %run.run_id, attempt, "claimed run");
                return Ok(Some(ClaimedRun {
                    run,
                    attempt,
                    cancel,
                }));
            }
            Ok(None) => {
                broker.unlock(run.run_id).await;
            }
            Err(err) => {
                broker.unlock(run.run_id).await;
                return Err(err);
            }
        }
    }
    Ok(None)
}

/// Re-check and transition under the lock. `None` means the claim was
/// lost — another worker won, the run was cancelled, or its thread is
/// already executing.
async fn try_claim(pool: &PgPool, run: &Run) -> Result<Option<i64>> {
    match runs::fetch_status(pool, run.run_id).await? {
        Some(RunStatus::Pending) => {}
        _ => return Ok(None),
    }
    if runs::count_running_for_thread(pool, run.thread_id).await? > 0 {
        return Ok(None);
    }

    let attempt = run.attempt() + 1;
    if !runs::mark_running(pool, run.run_id, attempt).await? {
        return Ok(None);
    }
    Ok(Some(attempt))
}
