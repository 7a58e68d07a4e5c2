//! Runs repository: creation (with inflight handling and merged
//! configuration), cancellation, join, and the row-level operations the
//! scheduler and sweeper drive.

use std::time::Duration;

use serde_json::{json, Map, Value};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use arbor_broker::{BrokerError, CancelSignal, GetOptions, StreamBroker};
use arbor_schemas::{merge_json, ControlAction, MultitaskStrategy, Run, RunStatus};

use crate::auth::{self, AuthContext};
use crate::error::{Result, StoreError};
use crate::threads::{self, SetStatus};

/// What to do when the target thread does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IfNotExists {
    #[default]
    Reject,
    Create,
}

#[derive(Debug, Clone)]
pub struct PutRun {
    pub run_id: Uuid,
    /// Absent means "create a fresh thread for this run".
    pub thread_id: Option<Uuid>,
    pub assistant_id: Uuid,
    pub kwargs: Value,
    pub metadata: Value,
    pub multitask_strategy: MultitaskStrategy,
    pub if_not_exists: IfNotExists,
    /// Delay scheduling by this many seconds (`created_at` lands in the
    /// future and the scheduler skips the row until due).
    pub after_seconds: i64,
    /// Reject strategy: return the inflight set without inserting.
    pub prevent_insert_in_inflight: bool,
    pub user_id: Option<String>,
}

impl PutRun {
    pub fn new(assistant_id: Uuid, kwargs: Value) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            thread_id: None,
            assistant_id,
            kwargs,
            metadata: json!({}),
            multitask_strategy: MultitaskStrategy::default(),
            if_not_exists: IfNotExists::default(),
            after_seconds: 0,
            prevent_insert_in_inflight: false,
            user_id: None,
        }
    }
}

const COLUMNS: &str = "run_id, thread_id, assistant_id, status, metadata, kwargs, \
                       multitask_strategy, created_at, updated_at";

fn from_row(row: &PgRow) -> Result<Run> {
    let status: String = row.try_get("status")?;
    let strategy: String = row.try_get("multitask_strategy")?;
    Ok(Run {
        run_id: row.try_get("run_id")?,
        thread_id: row.try_get("thread_id")?,
        assistant_id: row.try_get("assistant_id")?,
        status: RunStatus::parse(&status).map_err(StoreError::internal)?,
        metadata: row.try_get("metadata")?,
        kwargs: row.try_get("kwargs")?,
        multitask_strategy: MultitaskStrategy::parse(&strategy).map_err(StoreError::internal)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn configurable_of(value: &Value) -> Value {
    value
        .get("config")
        .and_then(|c| c.get("configurable"))
        .cloned()
        .unwrap_or_else(|| Value::Object(Map::new()))
}

/// Insert a run. Returns `[new_run, ...inflight]`, or just the inflight set
/// when `prevent_insert_in_inflight` short-circuits, or an empty vec when
/// the thread is missing and `if_not_exists = reject`.
pub async fn put(pool: &PgPool, auth: &dyn AuthContext, opts: PutRun) -> Result<Vec<Run>> {
    let decision = auth
        .handle(
            "threads:create_run",
            &json!({
                "run_id": opts.run_id,
                "thread_id": opts.thread_id,
                "assistant_id": opts.assistant_id,
                "metadata": opts.metadata,
            }),
        )
        .await?;

    let mut tx = pool.begin().await?;

    // 1. The assistant must exist and be visible.
    let assistant_row = sqlx::query(
        "select graph_id, config, metadata from assistants where assistant_id = $1",
    )
    .bind(opts.assistant_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(StoreError::NotFound("assistant"))?;
    let graph_id: String = assistant_row.try_get("graph_id")?;
    let assistant_config: Value = assistant_row.try_get("config")?;
    let assistant_metadata: Value = assistant_row.try_get("metadata")?;
    if !auth::matches(&assistant_metadata, decision.filter.as_ref()) {
        return Err(StoreError::NotFound("assistant"));
    }

    // 2. Load or create the thread.
    let thread_id = opts.thread_id.unwrap_or_else(Uuid::new_v4);
    let thread_row = sqlx::query(
        r#"select config, metadata from threads where thread_id = $1 for update"#,
    )
    .bind(thread_id)
    .fetch_optional(&mut *tx)
    .await?;

    let (thread_config, thread_metadata) = match thread_row {
        Some(row) => {
            let metadata: Value = row.try_get("metadata")?;
            if !auth::matches(&metadata, decision.filter.as_ref()) {
                return Err(StoreError::NotFound("thread"));
            }
            (row.try_get::<Value, _>("config")?, metadata)
        }
        None => {
            if opts.thread_id.is_some() && opts.if_not_exists == IfNotExists::Reject {
                return Ok(Vec::new());
            }
            let mut metadata = json!({
                "graph_id": graph_id.clone(),
                "assistant_id": opts.assistant_id,
            });
            if let Some(overrides) = &decision.mutable {
                metadata = merge_json(&metadata, overrides);
            }
            sqlx::query("insert into threads (thread_id, metadata) values ($1, $2)")
                .bind(thread_id)
                .bind(&metadata)
                .execute(&mut *tx)
                .await?;
            (json!({}), metadata)
        }
    };

    // 3. Inflight runs on the thread decide whether we insert at all.
    let inflight_rows = sqlx::query(&format!(
        r#"
        select {COLUMNS} from runs
         where thread_id = $1 and status in ('pending', 'running')
         order by created_at asc
        "#
    ))
    .bind(thread_id)
    .fetch_all(&mut *tx)
    .await?;
    let inflight = inflight_rows
        .iter()
        .map(from_row)
        .collect::<Result<Vec<_>>>()?;

    if opts.prevent_insert_in_inflight && !inflight.is_empty() {
        tx.commit().await?;
        return Ok(inflight);
    }

    // 4. Merge configurables and metadata (later sources win per key).
    let mut configurable = configurable_of(&assistant_config);
    configurable = merge_json(&configurable, &configurable_of(&thread_config));
    configurable = merge_json(&configurable, &configurable_of(&opts.kwargs));
    configurable = merge_json(
        &configurable,
        &json!({
            "run_id": opts.run_id,
            "thread_id": thread_id,
            "graph_id": graph_id,
            "assistant_id": opts.assistant_id,
            "user_id": opts.user_id,
        }),
    );

    let mut kwargs = opts.kwargs.clone();
    if !kwargs.is_object() {
        kwargs = Value::Object(Map::new());
    }
    let config_slot = kwargs
        .as_object_mut()
        .expect("kwargs coerced to object")
        .entry("config".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !config_slot.is_object() {
        *config_slot = Value::Object(Map::new());
    }
    config_slot
        .as_object_mut()
        .expect("config coerced to object")
        .insert("configurable".to_string(), configurable);

    let mut metadata = merge_json(&assistant_metadata, &thread_metadata);
    metadata = merge_json(&metadata, &opts.metadata);
    if let Some(overrides) = &decision.mutable {
        metadata = merge_json(&metadata, overrides);
    }

    // 5. Insert (possibly delayed) and mark the thread busy.
    let row = sqlx::query(&format!(
        r#"
        insert into runs
            (run_id, thread_id, assistant_id, metadata, kwargs, multitask_strategy, created_at)
        values
            ($1, $2, $3, $4, $5, $6, now() + make_interval(secs => $7::double precision))
        returning {COLUMNS}
        "#
    ))
    .bind(opts.run_id)
    .bind(thread_id)
    .bind(opts.assistant_id)
    .bind(&metadata)
    .bind(&kwargs)
    .bind(opts.multitask_strategy.as_str())
    .bind(opts.after_seconds as f64)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query("update threads set status = 'busy', updated_at = now() where thread_id = $1")
        .bind(thread_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    let mut result = vec![from_row(&row)?];
    result.extend(inflight);
    Ok(result)
}

pub async fn get(
    pool: &PgPool,
    auth: &dyn AuthContext,
    thread_id: Option<Uuid>,
    run_id: Uuid,
) -> Result<Run> {
    let decision = auth
        .handle("threads:read", &json!({ "run_id": run_id, "thread_id": thread_id }))
        .await?;

    let row = match thread_id {
        Some(thread_id) => {
            sqlx::query(&format!(
                "select {COLUMNS} from runs where run_id = $1 and thread_id = $2"
            ))
            .bind(run_id)
            .bind(thread_id)
            .fetch_optional(pool)
            .await?
        }
        None => {
            sqlx::query(&format!("select {COLUMNS} from runs where run_id = $1"))
                .bind(run_id)
                .fetch_optional(pool)
                .await?
        }
    }
    .ok_or(StoreError::NotFound("run"))?;

    let run = from_row(&row)?;
    if !auth::matches(&run.metadata, decision.filter.as_ref()) {
        return Err(StoreError::NotFound("run"));
    }
    Ok(run)
}

/// Runs on a thread, newest first.
pub async fn list(
    pool: &PgPool,
    auth: &dyn AuthContext,
    thread_id: Uuid,
    limit: Option<i64>,
    offset: Option<i64>,
) -> Result<Vec<Run>> {
    let decision = auth
        .handle("threads:read", &json!({ "thread_id": thread_id }))
        .await?;

    let rows = sqlx::query(&format!(
        r#"
        select {COLUMNS} from runs
         where thread_id = $1
         order by created_at desc
         limit $2 offset $3
        "#
    ))
    .bind(thread_id)
    .bind(limit.unwrap_or(10))
    .bind(offset.unwrap_or(0))
    .fetch_all(pool)
    .await?;

    let runs = rows
        .iter()
        .map(from_row)
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .filter(|run| auth::matches(&run.metadata, decision.filter.as_ref()))
        .collect();
    Ok(runs)
}

/// API-facing delete; running runs must be cancelled first.
pub async fn delete(
    pool: &PgPool,
    auth: &dyn AuthContext,
    thread_id: Option<Uuid>,
    run_id: Uuid,
) -> Result<()> {
    let run = get(pool, auth, thread_id, run_id).await?;
    if run.status == RunStatus::Running {
        return Err(StoreError::Conflict(format!(
            "run {run_id} is running; cancel it first"
        )));
    }
    sqlx::query("delete from runs where run_id = $1")
        .bind(run_id)
        .execute(pool)
        .await?;
    threads::set_status(pool, run.thread_id, SetStatus::default()).await?;
    Ok(())
}

/// Cancel runs with `interrupt` (cooperative stop) or `rollback` (erase).
/// Signals are published cluster-wide; row updates depend on the run's
/// current status. Not-found (including filtered) ids are reported after
/// every found run has been processed.
pub async fn cancel(
    pool: &PgPool,
    auth: &dyn AuthContext,
    broker: &dyn StreamBroker,
    thread_id: Option<Uuid>,
    run_ids: &[Uuid],
    action: ControlAction,
) -> Result<()> {
    if action == ControlAction::Done {
        return Err(StoreError::Validation(
            "cancel action must be interrupt or rollback".into(),
        ));
    }

    let mut missing = 0usize;
    for &run_id in run_ids {
        let run = match get(pool, auth, thread_id, run_id).await {
            Ok(run) => run,
            Err(StoreError::NotFound(_)) => {
                missing += 1;
                continue;
            }
            Err(err) => return Err(err),
        };

        // Aborts the local holder (fast path inside publish_control) and
        // remote holders via their control subscriptions.
        broker.publish_control(run_id, action).await?;
        debug!(%run_id, action = action.as_str(), "cancel signal published");

        match run.status {
            RunStatus::Pending => {
                if action == ControlAction::Rollback {
                    // Erase only while still pending. A scheduler mid-claim
                    // races this on the status column: its pending->running
                    // transition and this delete serialize, and whichever
                    // loses matches zero rows — a claimed run is rolled
                    // back by its worker instead.
                    sqlx::query("delete from runs where run_id = $1 and status = 'pending'")
                        .bind(run_id)
                        .execute(pool)
                        .await?;
                } else {
                    sqlx::query(
                        "update runs set status = 'interrupted', updated_at = now() \
                         where run_id = $1 and status = 'pending'",
                    )
                    .bind(run_id)
                    .execute(pool)
                    .await?;
                }
                threads::set_status(pool, run.thread_id, SetStatus::default()).await?;
            }
            // The worker observes the signal and writes the terminal state.
            RunStatus::Running => {}
            RunStatus::Error if action == ControlAction::Rollback => {
                mark_rolled_back(pool, run_id).await?;
            }
            RunStatus::Success | RunStatus::Error | RunStatus::Interrupted => {}
        }
    }

    if missing > 0 {
        return Err(StoreError::NotFound("run"));
    }
    Ok(())
}

/// Block until the run reaches a terminal status, returning the final
/// `values` payload or `{"__error__": ...}`.
pub async fn join(
    pool: &PgPool,
    auth: &dyn AuthContext,
    broker: &dyn StreamBroker,
    thread_id: Option<Uuid>,
    run_id: Uuid,
) -> Result<Value> {
    get(pool, auth, thread_id, run_id).await?;

    let cancel = CancelSignal::new();
    let mut last_seq = 0u64;
    let mut last_values: Option<Value> = None;
    let mut error: Option<Value> = None;

    loop {
        let opts = GetOptions::new(Duration::from_secs(1)).resume_after(last_seq);
        match broker.get(run_id, opts, &cancel).await {
            Ok((seq, event)) => {
                last_seq = seq;
                match event.topic_suffix() {
                    "control" => {
                        if event.data == json!(ControlAction::Done.as_str()) {
                            break;
                        }
                    }
                    "stream:values" => last_values = Some(event.data),
                    "stream:error" => error = Some(event.data),
                    _ => {}
                }
            }
            Err(BrokerError::Timeout) => {
                // The producer may be gone (crash, rollback); fall back to
                // the row's status.
                match get(pool, auth, thread_id, run_id).await {
                    Ok(run) if run.status.is_terminal() => break,
                    Ok(_) => {}
                    Err(StoreError::NotFound(_)) => break,
                    Err(err) => return Err(err),
                }
            }
            Err(err) => return Err(err.into()),
        }
    }

    if let Some(error) = error {
        return Ok(json!({ "__error__": error }));
    }
    Ok(last_values.unwrap_or(Value::Null))
}

// ---------------------------------------------------------------------------
// Scheduler / sweeper row operations
// ---------------------------------------------------------------------------

/// Pending runs that are due, oldest first. Delayed rows (future
/// `created_at`) are excluded until their time comes.
pub async fn list_pending(pool: &PgPool, limit: i64) -> Result<Vec<Run>> {
    let rows = sqlx::query(&format!(
        r#"
        select {COLUMNS} from runs
         where status = 'pending' and created_at <= now()
         order by created_at asc
         limit $1
        "#
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(from_row).collect()
}

pub async fn fetch_status(pool: &PgPool, run_id: Uuid) -> Result<Option<RunStatus>> {
    let row = sqlx::query("select status from runs where run_id = $1")
        .bind(run_id)
        .fetch_optional(pool)
        .await?;
    match row {
        None => Ok(None),
        Some(row) => {
            let status: String = row.try_get("status")?;
            Ok(Some(RunStatus::parse(&status).map_err(StoreError::internal)?))
        }
    }
}

pub async fn count_running_for_thread(pool: &PgPool, thread_id: Uuid) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "select count(*) from runs where thread_id = $1 and status = 'running'",
    )
    .bind(thread_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Claim transition: `pending -> running` with the attempt counter bumped
/// in the same statement. False when the row was taken or mutated first.
pub async fn mark_running(pool: &PgPool, run_id: Uuid, attempt: i64) -> Result<bool> {
    let retry = json!({ (Run::retry_key(run_id)): attempt });
    let result = sqlx::query(
        r#"
        update runs
           set status = 'running',
               metadata = metadata || $2,
               updated_at = now()
         where run_id = $1 and status = 'pending'
        "#,
    )
    .bind(run_id)
    .bind(&retry)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Terminal status write at the end of a worker attempt.
pub async fn set_status(pool: &PgPool, run_id: Uuid, status: RunStatus) -> Result<()> {
    sqlx::query("update runs set status = $2, updated_at = now() where run_id = $1")
        .bind(run_id)
        .bind(status.as_str())
        .execute(pool)
        .await?;
    Ok(())
}

/// Erase a run (rollback semantics).
pub async fn delete_row(pool: &PgPool, run_id: Uuid) -> Result<()> {
    sqlx::query("delete from runs where run_id = $1")
        .bind(run_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Stamp a terminal run that was asked to roll back after completion.
pub async fn mark_rolled_back(pool: &PgPool, run_id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        update runs
           set metadata = metadata || '{"rolled_back": true}'::jsonb,
               updated_at = now()
         where run_id = $1
        "#,
    )
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// All `running` rows; the sweeper cross-checks their broker locks.
pub async fn list_running(pool: &PgPool) -> Result<Vec<Run>> {
    let rows = sqlx::query(&format!(
        "select {COLUMNS} from runs where status = 'running' order by updated_at asc"
    ))
    .fetch_all(pool)
    .await?;
    rows.iter().map(from_row).collect()
}

/// Return an orphaned `running` row to the queue. False if the worker got
/// there first.
pub async fn requeue(pool: &PgPool, run_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "update runs set status = 'pending', updated_at = now() \
         where run_id = $1 and status = 'running'",
    )
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}
