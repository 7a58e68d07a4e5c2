//! Executes one claimed run end-to-end: drains graph events into the
//! broker, maps abort reasons onto terminal statuses, keeps the thread's
//! derived status current, and fires the optional completion webhook.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::{error, info, warn};

use arbor_broker::{CancelSignal, StreamBroker};
use arbor_db::{runs, threads, AllowAll};
use arbor_graph::{CheckpointStore, CheckpointTracker, GraphRunner, RunContext};
use arbor_schemas::{Checkpoint, ControlAction, Run, RunStatus, StreamEvent};

use crate::scheduler::ClaimedRun;

/// Attempt cap; claims past it fail fast without touching the graph.
const MAX_ATTEMPTS: i64 = 3;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct WorkerDeps {
    pub pool: PgPool,
    pub broker: Arc<dyn StreamBroker>,
    pub runner: Arc<dyn GraphRunner>,
    pub store: Arc<dyn CheckpointStore>,
    pub http: reqwest::Client,
}

enum Outcome {
    Success,
    Interrupted,
    Rollback,
    Error(String),
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Interrupted => "interrupted",
            Outcome::Rollback => "rollback",
            Outcome::Error(_) => "error",
        }
    }
}

/// Run a claimed run to completion. Never unwinds into the supervisor
/// loop: every failure is folded into the run's terminal state.
pub async fn execute(deps: &WorkerDeps, claimed: ClaimedRun) {
    let ClaimedRun {
        run,
        attempt,
        cancel,
    } = claimed;
    let run_id = run.run_id;
    let started_at = Utc::now();

    let resumable = run
        .kwargs
        .get("stream_resumable")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    deps.broker.get_queue(run_id, resumable).await;

    let tracker = CheckpointTracker::new();

    let outcome = if attempt > MAX_ATTEMPTS {
        Outcome::Error("exceeded max attempts".to_string())
    } else {
        drain_graph(deps, &run, attempt, &cancel, tracker.clone()).await
    };

    // An error raised while the signal is aborted is the abort, not a
    // failure of the run.
    let outcome = match outcome {
        Outcome::Error(message) => match cancel.reason() {
            Some(ControlAction::Interrupt) => Outcome::Interrupted,
            Some(ControlAction::Rollback) => Outcome::Rollback,
            _ => Outcome::Error(message),
        },
        other => other,
    };

    info!(%run_id, outcome = outcome.label(), attempt, "run finished");
    finish(deps, &run, outcome, tracker.latest(), started_at).await;
}

/// Invoke the graph and forward each `(event, data)` pair to the broker.
/// The abort signal is honored at every step boundary.
async fn drain_graph(
    deps: &WorkerDeps,
    run: &Run,
    attempt: i64,
    cancel: &CancelSignal,
    tracker: CheckpointTracker,
) -> Outcome {
    let ctx = RunContext {
        attempt,
        cancel: cancel.clone(),
        tracker,
    };

    let mut events = match deps.runner.run(run, ctx).await {
        Ok(stream) => stream,
        Err(err) => return Outcome::Error(err.to_string()),
    };

    loop {
        if cancel.is_aborted() {
            return match cancel.reason() {
                Some(ControlAction::Rollback) => Outcome::Rollback,
                _ => Outcome::Interrupted,
            };
        }

        match events.next().await {
            Some(Ok((event, data))) => {
                let stream_event = StreamEvent::stream(run.run_id, &event, data);
                if let Err(err) = deps.broker.push(run.run_id, stream_event).await {
                    return Outcome::Error(format!("stream push failed: {err}"));
                }
            }
            Some(Err(err)) => return Outcome::Error(err.to_string()),
            None => return Outcome::Success,
        }
    }
}

/// Terminal bookkeeping: run status (or deletion), the `done` control
/// event, thread status or teardown, webhook, lock release.
async fn finish(
    deps: &WorkerDeps,
    run: &Run,
    outcome: Outcome,
    checkpoint: Option<Checkpoint>,
    started_at: DateTime<Utc>,
) {
    let run_id = run.run_id;
    let exception = match &outcome {
        Outcome::Error(message) => Some(message.clone()),
        _ => None,
    };

    match &outcome {
        Outcome::Success => {
            if let Err(err) = runs::set_status(&deps.pool, run_id, RunStatus::Success).await {
                error!(%run_id, %err, "failed to store success status");
            }
        }
        Outcome::Interrupted => {
            if let Err(err) = runs::set_status(&deps.pool, run_id, RunStatus::Interrupted).await {
                error!(%run_id, %err, "failed to store interrupted status");
            }
        }
        Outcome::Rollback => {
            if let Err(err) = runs::delete_row(&deps.pool, run_id).await {
                error!(%run_id, %err, "failed to delete rolled-back run");
            }
        }
        Outcome::Error(message) => {
            let payload = json!({ "error": "RunError", "message": message });
            let event = StreamEvent::stream(run_id, "error", payload);
            if let Err(err) = deps.broker.push(run_id, event).await {
                warn!(%run_id, %err, "failed to publish error event");
            }
            if let Err(err) = runs::set_status(&deps.pool, run_id, RunStatus::Error).await {
                error!(%run_id, %err, "failed to store error status");
            }
        }
    }

    let done = StreamEvent::control(run_id, ControlAction::Done);
    if let Err(err) = deps.broker.push(run_id, done).await {
        warn!(%run_id, %err, "failed to publish done event");
    }

    let temporary = run
        .kwargs
        .get("temporary")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if temporary {
        if let Err(err) =
            threads::delete(&deps.pool, &AllowAll, deps.store.as_ref(), run.thread_id).await
        {
            error!(thread_id = %run.thread_id, %err, "failed to delete temporary thread");
        }
    } else {
        let status = threads::SetStatus {
            checkpoint: checkpoint.as_ref(),
            exception: exception.as_deref(),
        };
        if let Err(err) = threads::set_status(&deps.pool, run.thread_id, status).await {
            error!(thread_id = %run.thread_id, %err, "failed to update thread status");
        }
    }

    if let Some(webhook) = run.kwargs.get("webhook").and_then(Value::as_str) {
        fire_webhook(
            deps.http.clone(),
            webhook.to_string(),
            json!({
                "checkpoint": checkpoint,
                "status": outcome.label(),
                "exception": exception,
                "run": run,
                "started_at": started_at,
                "ended_at": Utc::now(),
            }),
        );
    }

    if matches!(outcome, Outcome::Rollback) {
        deps.broker.drop_queue(run_id).await;
    }
    deps.broker.unlock(run_id).await;
}

/// Fire-and-forget completion POST; delivery failures are logged only.
fn fire_webhook(http: reqwest::Client, url: String, body: Value) {
    tokio::spawn(async move {
        let result = http
            .post(&url)
            .timeout(WEBHOOK_TIMEOUT)
            .json(&body)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!(%url, status = %response.status(), "webhook rejected"),
            Err(err) => warn!(%url, %err, "webhook delivery failed"),
        }
    });
}

/// Build the shared HTTP client used for webhooks.
pub fn webhook_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(WEBHOOK_TIMEOUT)
        .build()
        .unwrap_or_default()
}
