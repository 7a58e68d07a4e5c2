//! Queue supervisor: spawns N workers that idle on the notifier (or a
//! jittered polling fallback when the listen connection is down) and run
//! claims to completion, plus the background sweeper.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{error, info};

use arbor_broker::CancelSignal;
use arbor_db::Notifier;

use crate::scheduler;
use crate::sweeper;
use crate::worker::{self, WorkerDeps};

/// How long a worker parks on the notifier before re-scanning anyway.
const NOTIFY_WAIT: Duration = Duration::from_secs(5);
/// Polling fallback upper bound while the notifier is disconnected.
const POLL_MAX: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { workers: 10 }
    }
}

/// Join handles for the spawned queue tasks; abort on shutdown.
pub struct QueueHandles {
    pub workers: Vec<tokio::task::JoinHandle<()>>,
    pub sweeper: tokio::task::JoinHandle<()>,
}

/// Start the worker pool and sweeper. `shutdown` stops every loop at its
/// next idle point.
pub fn start(
    config: QueueConfig,
    deps: WorkerDeps,
    notifier: Arc<Notifier>,
    shutdown: CancelSignal,
) -> QueueHandles {
    let workers = (0..config.workers.max(1))
        .map(|index| {
            let deps = deps.clone();
            let notifier = Arc::clone(&notifier);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                info!(worker = index, "queue worker started");
                worker_loop(deps, notifier, shutdown).await;
                info!(worker = index, "queue worker stopped");
            })
        })
        .collect();

    let sweeper = {
        let deps = deps.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { sweeper::run(deps, shutdown).await })
    };

    QueueHandles { workers, sweeper }
}

async fn worker_loop(deps: WorkerDeps, notifier: Arc<Notifier>, shutdown: CancelSignal) {
    while !shutdown.is_aborted() {
        match scheduler::next_run(&deps.pool, deps.broker.as_ref()).await {
            Ok(Some(claimed)) => {
                worker::execute(&deps, claimed).await;
                // Immediately re-scan: more runs may be due.
                continue;
            }
            Ok(None) => idle(&notifier, &shutdown).await,
            Err(err) => {
                error!(%err, "scheduler pass failed");
                sleep_with_shutdown(Duration::from_secs(1), &shutdown).await;
            }
        }
    }
}

/// Park until a pending-run notification lands, the wait times out, or —
/// with the notifier disconnected — a randomized 0–10 s poll interval
/// elapses.
async fn idle(notifier: &Notifier, shutdown: &CancelSignal) {
    if notifier.is_connected() {
        let _ = notifier.wait_for_notification(NOTIFY_WAIT, shutdown).await;
    } else {
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..POLL_MAX);
        sleep_with_shutdown(jitter, shutdown).await;
    }
}

async fn sleep_with_shutdown(duration: Duration, shutdown: &CancelSignal) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shutdown.aborted() => {}
    }
}
