//! Threads repository: CRUD + search, derived status, copy, and the state
//! operations that delegate to the checkpoint store.

use serde_json::{json, Value};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, QueryBuilder, Row};
use uuid::Uuid;

use arbor_graph::{CheckpointStore, StateUpdate};
use arbor_schemas::{merge_json, Checkpoint, IfExists, Thread, ThreadStatus};

use crate::assistants::SortOrder;
use crate::auth::{self, AuthContext};
use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Default)]
pub struct PutThread {
    pub config: Value,
    pub metadata: Value,
    pub if_exists: IfExists,
}

#[derive(Debug, Clone, Default)]
pub struct PatchThread {
    pub config: Option<Value>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchThreads {
    pub status: Option<ThreadStatus>,
    pub metadata: Option<Value>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    /// One of thread_id / status / created_at / updated_at.
    pub sort_by: Option<String>,
    pub sort_order: SortOrder,
}

/// Inputs to the derived-status rule.
#[derive(Debug, Clone, Default)]
pub struct SetStatus<'a> {
    pub checkpoint: Option<&'a Checkpoint>,
    /// Non-abort failure message from the last attempt.
    pub exception: Option<&'a str>,
}

const COLUMNS: &str =
    r#"thread_id, status, config, metadata, "values", interrupts, created_at, updated_at"#;

fn from_row(row: &PgRow) -> Result<Thread> {
    let status: String = row.try_get("status")?;
    Ok(Thread {
        thread_id: row.try_get("thread_id")?,
        status: ThreadStatus::parse(&status).map_err(StoreError::internal)?,
        config: row.try_get("config")?,
        metadata: row.try_get("metadata")?,
        values: row.try_get("values")?,
        interrupts: row.try_get("interrupts")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn put(
    pool: &PgPool,
    auth: &dyn AuthContext,
    thread_id: Uuid,
    opts: PutThread,
) -> Result<Thread> {
    let decision = auth
        .handle(
            "threads:create",
            &json!({ "thread_id": thread_id, "metadata": opts.metadata }),
        )
        .await?;
    let metadata = match &decision.mutable {
        Some(overrides) => merge_json(&opts.metadata, overrides),
        None => opts.metadata.clone(),
    };

    let mut tx = pool.begin().await?;
    let existing = sqlx::query(&format!(
        "select {COLUMNS} from threads where thread_id = $1 for update"
    ))
    .bind(thread_id)
    .fetch_optional(&mut *tx)
    .await?;

    if let Some(row) = existing {
        let existing = from_row(&row)?;
        if !auth::matches(&existing.metadata, decision.filter.as_ref()) {
            return Err(StoreError::NotFound("thread"));
        }
        return match opts.if_exists {
            IfExists::DoNothing => Ok(existing),
            IfExists::Raise => Err(StoreError::Conflict(format!(
                "thread {thread_id} already exists"
            ))),
        };
    }

    let row = sqlx::query(&format!(
        r#"
        insert into threads (thread_id, config, metadata)
        values ($1, $2, $3)
        returning {COLUMNS}
        "#
    ))
    .bind(thread_id)
    .bind(&opts.config)
    .bind(&metadata)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    from_row(&row)
}

pub async fn get(pool: &PgPool, auth: &dyn AuthContext, thread_id: Uuid) -> Result<Thread> {
    let decision = auth
        .handle("threads:read", &json!({ "thread_id": thread_id }))
        .await?;

    let row = sqlx::query(&format!(
        "select {COLUMNS} from threads where thread_id = $1"
    ))
    .bind(thread_id)
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::NotFound("thread"))?;

    let thread = from_row(&row)?;
    if !auth::matches(&thread.metadata, decision.filter.as_ref()) {
        return Err(StoreError::NotFound("thread"));
    }
    Ok(thread)
}

pub async fn patch(
    pool: &PgPool,
    auth: &dyn AuthContext,
    thread_id: Uuid,
    opts: PatchThread,
) -> Result<Thread> {
    let decision = auth
        .handle(
            "threads:update",
            &json!({ "thread_id": thread_id, "metadata": opts.metadata }),
        )
        .await?;

    let mut tx = pool.begin().await?;
    let row = sqlx::query(&format!(
        "select {COLUMNS} from threads where thread_id = $1 for update"
    ))
    .bind(thread_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(StoreError::NotFound("thread"))?;
    let current = from_row(&row)?;
    if !auth::matches(&current.metadata, decision.filter.as_ref()) {
        return Err(StoreError::NotFound("thread"));
    }

    let config = opts.config.unwrap_or(current.config);
    let mut metadata = match &opts.metadata {
        Some(supplied) => merge_json(&current.metadata, supplied),
        None => current.metadata,
    };
    if let Some(overrides) = &decision.mutable {
        metadata = merge_json(&metadata, overrides);
    }

    let row = sqlx::query(&format!(
        r#"
        update threads
           set config = $2,
               metadata = $3,
               updated_at = now()
         where thread_id = $1
        returning {COLUMNS}
        "#
    ))
    .bind(thread_id)
    .bind(&config)
    .bind(&metadata)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    from_row(&row)
}

/// Delete the thread row (runs cascade) and its checkpoints.
pub async fn delete(
    pool: &PgPool,
    auth: &dyn AuthContext,
    store: &dyn CheckpointStore,
    thread_id: Uuid,
) -> Result<()> {
    let decision = auth
        .handle("threads:delete", &json!({ "thread_id": thread_id }))
        .await?;

    let mut tx = pool.begin().await?;
    let row = sqlx::query("select metadata from threads where thread_id = $1 for update")
        .bind(thread_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound("thread"))?;
    let metadata: Value = row.try_get("metadata")?;
    if !auth::matches(&metadata, decision.filter.as_ref()) {
        return Err(StoreError::NotFound("thread"));
    }

    sqlx::query("delete from threads where thread_id = $1")
        .bind(thread_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    store
        .delete_thread(thread_id)
        .await
        .map_err(StoreError::internal)?;
    Ok(())
}

const SORTABLE: &[&str] = &["thread_id", "status", "created_at", "updated_at"];

pub async fn search(
    pool: &PgPool,
    auth: &dyn AuthContext,
    opts: SearchThreads,
) -> Result<(Vec<Thread>, i64)> {
    let decision = auth
        .handle("threads:search", &json!({ "metadata": opts.metadata }))
        .await?;

    let sort_by = match opts.sort_by.as_deref() {
        None => "created_at",
        Some(col) if SORTABLE.contains(&col) => col,
        Some(other) => {
            return Err(StoreError::Validation(format!(
                "unsupported sort_by: {other}"
            )))
        }
    };

    let mut qb = QueryBuilder::new(format!(
        "select {COLUMNS}, count(*) over() as total from threads where true"
    ));
    if let Some(status) = opts.status {
        qb.push(" and status = ").push_bind(status.as_str());
    }
    if let Some(metadata) = &opts.metadata {
        qb.push(" and metadata @> ").push_bind(metadata);
    }
    if let Some(filter) = &decision.filter {
        qb.push(" and metadata @> ").push_bind(filter);
    }
    qb.push(format!(" order by {sort_by} {}", opts.sort_order.sql()));
    qb.push(" limit ").push_bind(opts.limit.unwrap_or(10));
    qb.push(" offset ").push_bind(opts.offset.unwrap_or(0));

    let rows = qb.build().fetch_all(pool).await?;
    let total = rows
        .first()
        .map(|row| row.try_get::<i64, _>("total"))
        .transpose()?
        .unwrap_or(0);
    let threads = rows.iter().map(from_row).collect::<Result<Vec<_>>>()?;
    Ok((threads, total))
}

/// Derive and persist the thread's status after a run attempt:
/// error on a non-abort exception, else interrupted when the checkpoint
/// left work scheduled, else busy while pending runs remain, else idle.
/// Idempotent for a fixed `(checkpoint, exception)` and run set.
pub async fn set_status(pool: &PgPool, thread_id: Uuid, opts: SetStatus<'_>) -> Result<Thread> {
    let (pending,): (i64,) = sqlx::query_as(
        "select count(*) from runs where thread_id = $1 and status = 'pending'",
    )
    .bind(thread_id)
    .fetch_one(pool)
    .await?;

    let status = if opts.exception.is_some() {
        ThreadStatus::Error
    } else if opts
        .checkpoint
        .map(|cp| !cp.next.is_empty())
        .unwrap_or(false)
    {
        ThreadStatus::Interrupted
    } else if pending > 0 {
        ThreadStatus::Busy
    } else {
        ThreadStatus::Idle
    };

    let values = opts.checkpoint.map(|cp| cp.values.clone());
    let interrupts = opts.checkpoint.map(|cp| cp.interrupts());

    let row = sqlx::query(&format!(
        r#"
        update threads
           set status = $2,
               "values" = coalesce($3, "values"),
               interrupts = coalesce($4, interrupts),
               updated_at = now()
         where thread_id = $1
        returning {COLUMNS}
        "#
    ))
    .bind(thread_id)
    .bind(status.as_str())
    .bind(&values)
    .bind(&interrupts)
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::NotFound("thread"))?;

    from_row(&row)
}

/// Duplicate a thread: fresh id, copied config/metadata (with
/// `metadata.thread_id` rewritten), and every checkpoint of the source
/// cloned onto the copy.
pub async fn copy(
    pool: &PgPool,
    auth: &dyn AuthContext,
    store: &dyn CheckpointStore,
    thread_id: Uuid,
) -> Result<Thread> {
    let decision = auth
        .handle("threads:create", &json!({ "thread_id": thread_id }))
        .await?;

    let source = get(pool, auth, thread_id).await?;
    let new_id = Uuid::new_v4();
    let mut metadata = merge_json(&source.metadata, &json!({ "thread_id": new_id }));
    if let Some(overrides) = &decision.mutable {
        metadata = merge_json(&metadata, overrides);
    }

    let mut tx = pool.begin().await?;
    let row = sqlx::query(&format!(
        r#"
        insert into threads (thread_id, status, config, metadata, "values", interrupts)
        values ($1, 'idle', $2, $3, $4, $5)
        returning {COLUMNS}
        "#
    ))
    .bind(new_id)
    .bind(&source.config)
    .bind(&metadata)
    .bind(&source.values)
    .bind(&source.interrupts)
    .fetch_one(&mut *tx)
    .await?;

    store
        .copy_thread(thread_id, new_id)
        .await
        .map_err(StoreError::internal)?;

    tx.commit().await?;
    from_row(&row)
}

// ---------------------------------------------------------------------------
// Thread state (delegated to the checkpoint store)
// ---------------------------------------------------------------------------

/// Latest graph state for the thread, if any checkpoint exists.
pub async fn state_get(
    pool: &PgPool,
    auth: &dyn AuthContext,
    store: &dyn CheckpointStore,
    thread_id: Uuid,
) -> Result<Option<Checkpoint>> {
    get(pool, auth, thread_id).await?;
    store
        .get_state(thread_id)
        .await
        .map_err(StoreError::internal)
}

/// Write a state update. Conflicts while a non-terminal run exists for the
/// thread — state mutation under a live run would race the worker.
pub async fn state_post(
    pool: &PgPool,
    auth: &dyn AuthContext,
    store: &dyn CheckpointStore,
    thread_id: Uuid,
    update: StateUpdate,
) -> Result<Checkpoint> {
    ensure_no_inflight(pool, auth, thread_id, "threads:update_state").await?;

    let checkpoint = store
        .update_state(thread_id, update)
        .await
        .map_err(StoreError::internal)?;
    set_status(
        pool,
        thread_id,
        SetStatus {
            checkpoint: Some(&checkpoint),
            exception: None,
        },
    )
    .await?;
    Ok(checkpoint)
}

/// Apply a batch of updates atomically.
pub async fn state_bulk(
    pool: &PgPool,
    auth: &dyn AuthContext,
    store: &dyn CheckpointStore,
    thread_id: Uuid,
    updates: Vec<StateUpdate>,
) -> Result<Checkpoint> {
    ensure_no_inflight(pool, auth, thread_id, "threads:update_state").await?;

    let checkpoint = store
        .bulk_update_state(thread_id, updates)
        .await
        .map_err(StoreError::internal)?;
    set_status(
        pool,
        thread_id,
        SetStatus {
            checkpoint: Some(&checkpoint),
            exception: None,
        },
    )
    .await?;
    Ok(checkpoint)
}

/// Checkpoint history, newest first.
pub async fn state_history(
    pool: &PgPool,
    auth: &dyn AuthContext,
    store: &dyn CheckpointStore,
    thread_id: Uuid,
    limit: Option<usize>,
) -> Result<Vec<Checkpoint>> {
    get(pool, auth, thread_id).await?;
    store
        .get_state_history(thread_id, limit)
        .await
        .map_err(StoreError::internal)
}

async fn ensure_no_inflight(
    pool: &PgPool,
    auth: &dyn AuthContext,
    thread_id: Uuid,
    event: &str,
) -> Result<()> {
    let decision = auth.handle(event, &json!({ "thread_id": thread_id })).await?;
    let row = sqlx::query("select metadata from threads where thread_id = $1")
        .bind(thread_id)
        .fetch_optional(pool)
        .await?
        .ok_or(StoreError::NotFound("thread"))?;
    let metadata: Value = row.try_get("metadata")?;
    if !auth::matches(&metadata, decision.filter.as_ref()) {
        return Err(StoreError::NotFound("thread"));
    }

    let (inflight,): (i64,) = sqlx::query_as(
        "select count(*) from runs where thread_id = $1 and status in ('pending', 'running')",
    )
    .bind(thread_id)
    .fetch_one(pool)
    .await?;
    if inflight > 0 {
        return Err(StoreError::Conflict(format!(
            "thread {thread_id} has {inflight} inflight run(s)"
        )));
    }
    Ok(())
}
