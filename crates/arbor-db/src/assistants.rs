//! Assistants repository: versioned CRUD + search.
//!
//! Every mutation allocates or reuses rows inside one transaction so the
//! "all versions 1..=current exist" invariant holds under concurrency.

use serde_json::{json, Value};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, QueryBuilder, Row};
use uuid::Uuid;

use arbor_schemas::{merge_json, Assistant, AssistantVersion, IfExists};

use crate::auth::{self, AuthContext};
use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub(crate) fn sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PutAssistant {
    pub graph_id: String,
    pub name: String,
    pub description: Option<String>,
    pub config: Value,
    pub context: Option<Value>,
    pub metadata: Value,
    pub if_exists: IfExists,
}

#[derive(Debug, Clone, Default)]
pub struct PatchAssistant {
    pub graph_id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub config: Option<Value>,
    pub context: Option<Value>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchAssistants {
    pub graph_id: Option<String>,
    /// Case-insensitive substring match.
    pub name: Option<String>,
    /// Metadata containment filter.
    pub metadata: Option<Value>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    /// One of assistant_id / graph_id / name / created_at / updated_at.
    pub sort_by: Option<String>,
    pub sort_order: SortOrder,
}

fn from_row(row: &PgRow) -> Result<Assistant> {
    Ok(Assistant {
        assistant_id: row.try_get("assistant_id")?,
        graph_id: row.try_get("graph_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        config: row.try_get("config")?,
        context: row.try_get("context")?,
        metadata: row.try_get("metadata")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn version_from_row(row: &PgRow) -> Result<AssistantVersion> {
    Ok(AssistantVersion {
        assistant_id: row.try_get("assistant_id")?,
        version: row.try_get("version")?,
        graph_id: row.try_get("graph_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        config: row.try_get("config")?,
        context: row.try_get("context")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

const COLUMNS: &str = "assistant_id, graph_id, name, description, config, context, metadata, \
                       version, created_at, updated_at";

/// Merge the caller's metadata with the auth decision's mutable overrides.
fn effective_metadata(supplied: &Value, mutable: Option<&Value>) -> Value {
    match mutable {
        Some(overrides) => merge_json(supplied, overrides),
        None => supplied.clone(),
    }
}

/// Create an assistant (version 1). Idempotent under
/// `if_exists = do_nothing`; conflicts under `raise`.
pub async fn put(
    pool: &PgPool,
    auth: &dyn AuthContext,
    assistant_id: Uuid,
    opts: PutAssistant,
) -> Result<Assistant> {
    let decision = auth
        .handle(
            "assistants:create",
            &json!({
                "assistant_id": assistant_id,
                "graph_id": opts.graph_id,
                "metadata": opts.metadata,
            }),
        )
        .await?;
    let metadata = effective_metadata(&opts.metadata, decision.mutable.as_ref());

    let mut tx = pool.begin().await?;

    let existing = sqlx::query(&format!(
        "select {COLUMNS} from assistants where assistant_id = $1 for update"
    ))
    .bind(assistant_id)
    .fetch_optional(&mut *tx)
    .await?;

    if let Some(row) = existing {
        let existing = from_row(&row)?;
        if !auth::matches(&existing.metadata, decision.filter.as_ref()) {
            return Err(StoreError::NotFound("assistant"));
        }
        return match opts.if_exists {
            IfExists::DoNothing => Ok(existing),
            IfExists::Raise => Err(StoreError::Conflict(format!(
                "assistant {assistant_id} already exists"
            ))),
        };
    }

    let row = sqlx::query(&format!(
        r#"
        insert into assistants (assistant_id, graph_id, name, description, config, context, metadata, version)
        values ($1, $2, $3, $4, $5, $6, $7, 1)
        returning {COLUMNS}
        "#
    ))
    .bind(assistant_id)
    .bind(&opts.graph_id)
    .bind(&opts.name)
    .bind(&opts.description)
    .bind(&opts.config)
    .bind(&opts.context)
    .bind(&metadata)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        insert into assistant_versions
            (assistant_id, version, graph_id, name, description, config, context, metadata)
        values ($1, 1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(assistant_id)
    .bind(&opts.graph_id)
    .bind(&opts.name)
    .bind(&opts.description)
    .bind(&opts.config)
    .bind(&opts.context)
    .bind(&metadata)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    from_row(&row)
}

pub async fn get(pool: &PgPool, auth: &dyn AuthContext, assistant_id: Uuid) -> Result<Assistant> {
    let decision = auth
        .handle("assistants:read", &json!({ "assistant_id": assistant_id }))
        .await?;

    let row = sqlx::query(&format!(
        "select {COLUMNS} from assistants where assistant_id = $1"
    ))
    .bind(assistant_id)
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::NotFound("assistant"))?;

    let assistant = from_row(&row)?;
    if !auth::matches(&assistant.metadata, decision.filter.as_ref()) {
        return Err(StoreError::NotFound("assistant"));
    }
    Ok(assistant)
}

/// Mutate an assistant, allocating version `max(existing) + 1`.
pub async fn patch(
    pool: &PgPool,
    auth: &dyn AuthContext,
    assistant_id: Uuid,
    opts: PatchAssistant,
) -> Result<Assistant> {
    let decision = auth
        .handle(
            "assistants:update",
            &json!({ "assistant_id": assistant_id, "metadata": opts.metadata }),
        )
        .await?;

    let mut tx = pool.begin().await?;

    let row = sqlx::query(&format!(
        "select {COLUMNS} from assistants where assistant_id = $1 for update"
    ))
    .bind(assistant_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(StoreError::NotFound("assistant"))?;
    let current = from_row(&row)?;
    if !auth::matches(&current.metadata, decision.filter.as_ref()) {
        return Err(StoreError::NotFound("assistant"));
    }

    let (next_version,): (i32,) = sqlx::query_as(
        "select coalesce(max(version), 0) + 1 from assistant_versions where assistant_id = $1",
    )
    .bind(assistant_id)
    .fetch_one(&mut *tx)
    .await?;

    let graph_id = opts.graph_id.unwrap_or(current.graph_id);
    let name = opts.name.unwrap_or(current.name);
    let description = opts.description.or(current.description);
    let config = opts.config.unwrap_or(current.config);
    let context = opts.context.or(current.context);
    let mut metadata = match &opts.metadata {
        Some(supplied) => merge_json(&current.metadata, supplied),
        None => current.metadata,
    };
    metadata = effective_metadata(&metadata, decision.mutable.as_ref());

    let row = sqlx::query(&format!(
        r#"
        update assistants
           set graph_id = $2,
               name = $3,
               description = $4,
               config = $5,
               context = $6,
               metadata = $7,
               version = $8,
               updated_at = now()
         where assistant_id = $1
        returning {COLUMNS}
        "#
    ))
    .bind(assistant_id)
    .bind(&graph_id)
    .bind(&name)
    .bind(&description)
    .bind(&config)
    .bind(&context)
    .bind(&metadata)
    .bind(next_version)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        insert into assistant_versions
            (assistant_id, version, graph_id, name, description, config, context, metadata)
        values ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(assistant_id)
    .bind(next_version)
    .bind(&graph_id)
    .bind(&name)
    .bind(&description)
    .bind(&config)
    .bind(&context)
    .bind(&metadata)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    from_row(&row)
}

/// Copy a historical version's content into the current row. No new
/// version row is allocated; `get_versions` is unaffected.
pub async fn set_latest(
    pool: &PgPool,
    auth: &dyn AuthContext,
    assistant_id: Uuid,
    version: i32,
) -> Result<Assistant> {
    let decision = auth
        .handle(
            "assistants:update",
            &json!({ "assistant_id": assistant_id, "version": version }),
        )
        .await?;

    let mut tx = pool.begin().await?;

    let row = sqlx::query("select metadata from assistants where assistant_id = $1 for update")
        .bind(assistant_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound("assistant"))?;
    let metadata: Value = row.try_get("metadata")?;
    if !auth::matches(&metadata, decision.filter.as_ref()) {
        return Err(StoreError::NotFound("assistant"));
    }

    let row = sqlx::query(&format!(
        r#"
        update assistants a
           set graph_id = v.graph_id,
               name = v.name,
               description = v.description,
               config = v.config,
               context = v.context,
               metadata = v.metadata,
               version = v.version,
               updated_at = now()
          from assistant_versions v
         where a.assistant_id = $1
           and v.assistant_id = a.assistant_id
           and v.version = $2
        returning a.assistant_id, a.graph_id, a.name, a.description, a.config, a.context,
                  a.metadata, a.version, a.created_at, a.updated_at
        "#
    ))
    .bind(assistant_id)
    .bind(version)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(StoreError::NotFound("assistant version"))?;

    tx.commit().await?;
    from_row(&row)
}

/// Historical versions, newest first.
pub async fn get_versions(
    pool: &PgPool,
    auth: &dyn AuthContext,
    assistant_id: Uuid,
    limit: Option<i64>,
    offset: Option<i64>,
) -> Result<Vec<AssistantVersion>> {
    // Visibility is decided on the current row, like every other read.
    get(pool, auth, assistant_id).await?;

    let rows = sqlx::query(
        r#"
        select assistant_id, version, graph_id, name, description, config, context, metadata, created_at
          from assistant_versions
         where assistant_id = $1
         order by version desc
         limit $2 offset $3
        "#,
    )
    .bind(assistant_id)
    .bind(limit.unwrap_or(100))
    .bind(offset.unwrap_or(0))
    .fetch_all(pool)
    .await?;

    rows.iter().map(version_from_row).collect()
}

/// Delete the assistant; runs referencing it cascade.
pub async fn delete(pool: &PgPool, auth: &dyn AuthContext, assistant_id: Uuid) -> Result<()> {
    let decision = auth
        .handle("assistants:delete", &json!({ "assistant_id": assistant_id }))
        .await?;

    let mut tx = pool.begin().await?;
    let row = sqlx::query("select metadata from assistants where assistant_id = $1 for update")
        .bind(assistant_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound("assistant"))?;
    let metadata: Value = row.try_get("metadata")?;
    if !auth::matches(&metadata, decision.filter.as_ref()) {
        return Err(StoreError::NotFound("assistant"));
    }

    sqlx::query("delete from assistants where assistant_id = $1")
        .bind(assistant_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

const SORTABLE: &[&str] = &["assistant_id", "graph_id", "name", "created_at", "updated_at"];

/// Search with pre-pagination totals: each row carries the total match
/// count via a window aggregate.
pub async fn search(
    pool: &PgPool,
    auth: &dyn AuthContext,
    opts: SearchAssistants,
) -> Result<(Vec<Assistant>, i64)> {
    let decision = auth
        .handle(
            "assistants:search",
            &json!({ "graph_id": opts.graph_id, "metadata": opts.metadata }),
        )
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
        "select {COLUMNS}, count(*) over() as total from assistants where true"
    ));
    if let Some(graph_id) = &opts.graph_id {
        qb.push(" and graph_id = ").push_bind(graph_id);
    }
    if let Some(name) = &opts.name {
        qb.push(" and name ilike ").push_bind(format!("%{name}%"));
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
    let assistants = rows.iter().map(from_row).collect::<Result<Vec<_>>>()?;
    Ok((assistants, total))
}
