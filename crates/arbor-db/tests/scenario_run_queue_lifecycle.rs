//! Run insertion, inflight handling, the claim transition, and
//! cancellation row semantics.
//!
//! Skips when DATABASE_URL is not set.

use serde_json::json;
use uuid::Uuid;

use arbor_broker::{MemoryBroker, StreamBroker};
use arbor_db::assistants::{self, PutAssistant};
use arbor_db::runs::{self, IfNotExists, PutRun};
use arbor_db::{threads, AllowAll, StoreError};
use arbor_schemas::{ControlAction, MultitaskStrategy, RunStatus, ThreadStatus};

async fn db_pool() -> Option<sqlx::PgPool> {
    let url = match std::env::var(arbor_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: DATABASE_URL not set");
            return None;
        }
    };
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("connect to test database");
    arbor_db::migrate(&pool).await.expect("migrate");
    Some(pool)
}

async fn seed_assistant(pool: &sqlx::PgPool) -> Uuid {
    let id = Uuid::new_v4();
    assistants::put(
        pool,
        &AllowAll,
        id,
        PutAssistant {
            graph_id: "agent".to_string(),
            name: "queue-suite".to_string(),
            description: None,
            config: json!({"configurable": {"model": "base"}}),
            context: None,
            metadata: json!({}),
            if_exists: arbor_schemas::IfExists::Raise,
        },
    )
    .await
    .expect("seed assistant");
    id
}

fn put_run(assistant_id: Uuid) -> PutRun {
    PutRun::new(assistant_id, json!({"input": {"q": "hi"}}))
}

#[tokio::test]
async fn put_creates_thread_merges_config_and_marks_busy() -> anyhow::Result<()> {
    let Some(pool) = db_pool().await else {
        return Ok(());
    };
    let assistant_id = seed_assistant(&pool).await;

    let created = runs::put(&pool, &AllowAll, put_run(assistant_id)).await?;
    assert_eq!(created.len(), 1);
    let run = &created[0];
    assert_eq!(run.status, RunStatus::Pending);

    // Merged configurable carries identity keys plus the assistant's own
    // configurable entries.
    let configurable = &run.kwargs["config"]["configurable"];
    assert_eq!(configurable["model"], "base");
    assert_eq!(configurable["run_id"], json!(run.run_id));
    assert_eq!(configurable["thread_id"], json!(run.thread_id));
    assert_eq!(configurable["assistant_id"], json!(assistant_id));

    let thread = threads::get(&pool, &AllowAll, run.thread_id).await?;
    assert_eq!(thread.status, ThreadStatus::Busy);

    assistants::delete(&pool, &AllowAll, assistant_id).await?;
    Ok(())
}

#[tokio::test]
async fn reject_strategy_returns_inflight_without_insert() -> anyhow::Result<()> {
    let Some(pool) = db_pool().await else {
        return Ok(());
    };
    let assistant_id = seed_assistant(&pool).await;

    let first = runs::put(&pool, &AllowAll, put_run(assistant_id)).await?;
    let r1 = first[0].clone();

    // Second run on the same thread with the reject strategy: the inflight
    // set comes back and nothing is inserted.
    let mut second = put_run(assistant_id);
    second.thread_id = Some(r1.thread_id);
    second.multitask_strategy = MultitaskStrategy::Reject;
    second.prevent_insert_in_inflight = true;
    let r2_id = second.run_id;

    let result = runs::put(&pool, &AllowAll, second).await?;
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].run_id, r1.run_id);
    assert!(runs::fetch_status(&pool, r2_id).await?.is_none());

    assistants::delete(&pool, &AllowAll, assistant_id).await?;
    Ok(())
}

#[tokio::test]
async fn missing_thread_rejected_unless_create() -> anyhow::Result<()> {
    let Some(pool) = db_pool().await else {
        return Ok(());
    };
    let assistant_id = seed_assistant(&pool).await;
    let ghost_thread = Uuid::new_v4();

    let mut reject = put_run(assistant_id);
    reject.thread_id = Some(ghost_thread);
    reject.if_not_exists = IfNotExists::Reject;
    assert!(runs::put(&pool, &AllowAll, reject).await?.is_empty());

    let mut create = put_run(assistant_id);
    create.thread_id = Some(ghost_thread);
    create.if_not_exists = IfNotExists::Create;
    let created = runs::put(&pool, &AllowAll, create).await?;
    assert_eq!(created[0].thread_id, ghost_thread);

    assistants::delete(&pool, &AllowAll, assistant_id).await?;
    Ok(())
}

#[tokio::test]
async fn delayed_runs_stay_out_of_the_pending_scan() -> anyhow::Result<()> {
    let Some(pool) = db_pool().await else {
        return Ok(());
    };
    let assistant_id = seed_assistant(&pool).await;

    let mut delayed = put_run(assistant_id);
    delayed.after_seconds = 3600;
    let created = runs::put(&pool, &AllowAll, delayed).await?;
    let run_id = created[0].run_id;

    let due = runs::list_pending(&pool, 1000).await?;
    assert!(
        due.iter().all(|run| run.run_id != run_id),
        "delayed run must not be dispatched before its created_at"
    );

    assistants::delete(&pool, &AllowAll, assistant_id).await?;
    Ok(())
}

#[tokio::test]
async fn claim_increments_attempt_and_is_single_shot() -> anyhow::Result<()> {
    let Some(pool) = db_pool().await else {
        return Ok(());
    };
    let assistant_id = seed_assistant(&pool).await;
    let created = runs::put(&pool, &AllowAll, put_run(assistant_id)).await?;
    let run = created[0].clone();

    assert!(runs::mark_running(&pool, run.run_id, 1).await?);
    // A second claim on the same row loses the race.
    assert!(!runs::mark_running(&pool, run.run_id, 2).await?);

    let claimed = runs::get(&pool, &AllowAll, None, run.run_id).await?;
    assert_eq!(claimed.status, RunStatus::Running);
    assert_eq!(claimed.attempt(), 1);
    assert_eq!(runs::count_running_for_thread(&pool, run.thread_id).await?, 1);

    assistants::delete(&pool, &AllowAll, assistant_id).await?;
    Ok(())
}

#[tokio::test]
async fn rollback_of_unscheduled_pending_run_deletes_the_row() -> anyhow::Result<()> {
    let Some(pool) = db_pool().await else {
        return Ok(());
    };
    let assistant_id = seed_assistant(&pool).await;
    let broker = MemoryBroker::new();

    let mut delayed = put_run(assistant_id);
    delayed.after_seconds = 60;
    let created = runs::put(&pool, &AllowAll, delayed).await?;
    let run = created[0].clone();

    runs::cancel(
        &pool,
        &AllowAll,
        &broker,
        None,
        &[run.run_id],
        ControlAction::Rollback,
    )
    .await?;

    assert!(runs::fetch_status(&pool, run.run_id).await?.is_none());
    let thread = threads::get(&pool, &AllowAll, run.thread_id).await?;
    assert_eq!(thread.status, ThreadStatus::Idle);

    assistants::delete(&pool, &AllowAll, assistant_id).await?;
    Ok(())
}

#[tokio::test]
async fn rollback_during_claim_window_still_deletes_pending_row() -> anyhow::Result<()> {
    let Some(pool) = db_pool().await else {
        return Ok(());
    };
    let assistant_id = seed_assistant(&pool).await;
    let broker = MemoryBroker::new();

    let created = runs::put(&pool, &AllowAll, put_run(assistant_id)).await?;
    let run = created[0].clone();

    // A scheduler takes the broker lock before flipping the row to
    // running; a rollback landing in that window must still erase the
    // still-pending row.
    let _signal = broker.lock(run.run_id).await?;

    runs::cancel(
        &pool,
        &AllowAll,
        &broker,
        None,
        &[run.run_id],
        ControlAction::Rollback,
    )
    .await?;

    assert!(runs::fetch_status(&pool, run.run_id).await?.is_none());
    let thread = threads::get(&pool, &AllowAll, run.thread_id).await?;
    assert_eq!(thread.status, ThreadStatus::Idle);

    broker.unlock(run.run_id).await;
    assistants::delete(&pool, &AllowAll, assistant_id).await?;
    Ok(())
}

#[tokio::test]
async fn interrupt_of_pending_run_marks_interrupted() -> anyhow::Result<()> {
    let Some(pool) = db_pool().await else {
        return Ok(());
    };
    let assistant_id = seed_assistant(&pool).await;
    let broker = MemoryBroker::new();

    let mut delayed = put_run(assistant_id);
    delayed.after_seconds = 60;
    let created = runs::put(&pool, &AllowAll, delayed).await?;
    let run = created[0].clone();

    runs::cancel(
        &pool,
        &AllowAll,
        &broker,
        None,
        &[run.run_id],
        ControlAction::Interrupt,
    )
    .await?;

    assert_eq!(
        runs::fetch_status(&pool, run.run_id).await?,
        Some(RunStatus::Interrupted)
    );

    assistants::delete(&pool, &AllowAll, assistant_id).await?;
    Ok(())
}

#[tokio::test]
async fn cancel_with_any_unknown_id_is_not_found() -> anyhow::Result<()> {
    let Some(pool) = db_pool().await else {
        return Ok(());
    };
    let assistant_id = seed_assistant(&pool).await;
    let broker = MemoryBroker::new();

    let mut delayed = put_run(assistant_id);
    delayed.after_seconds = 60;
    let created = runs::put(&pool, &AllowAll, delayed).await?;
    let run = created[0].clone();

    let err = runs::cancel(
        &pool,
        &AllowAll,
        &broker,
        None,
        &[run.run_id, Uuid::new_v4()],
        ControlAction::Interrupt,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)), "got {err}");

    // The known run was still processed before the 404 was reported.
    assert_eq!(
        runs::fetch_status(&pool, run.run_id).await?,
        Some(RunStatus::Interrupted)
    );

    assistants::delete(&pool, &AllowAll, assistant_id).await?;
    Ok(())
}

#[tokio::test]
async fn cancel_signal_reaches_a_locked_holder() -> anyhow::Result<()> {
    let Some(pool) = db_pool().await else {
        return Ok(());
    };
    let assistant_id = seed_assistant(&pool).await;
    let broker = MemoryBroker::new();

    let created = runs::put(&pool, &AllowAll, put_run(assistant_id)).await?;
    let run = created[0].clone();

    // Simulate a worker mid-execution: lock held, row running.
    let signal = broker.lock(run.run_id).await?;
    runs::mark_running(&pool, run.run_id, 1).await?;

    runs::cancel(
        &pool,
        &AllowAll,
        &broker,
        None,
        &[run.run_id],
        ControlAction::Interrupt,
    )
    .await?;

    assert!(signal.is_aborted());
    assert_eq!(signal.reason(), Some(ControlAction::Interrupt));
    // Running rows are left for the worker to finalize.
    assert_eq!(
        runs::fetch_status(&pool, run.run_id).await?,
        Some(RunStatus::Running)
    );

    broker.unlock(run.run_id).await;
    assistants::delete(&pool, &AllowAll, assistant_id).await?;
    Ok(())
}
