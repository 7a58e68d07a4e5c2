//! Axum router and all HTTP handlers for arbor-server.
//!
//! `build_router` is the single entry point; `main.rs` calls it and
//! attaches middleware layers. All handlers are `pub(crate)` so the
//! scenario tests in `tests/` can compose the router directly.

use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::Stream;
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use arbor_broker::{BrokerError, CancelSignal, GetOptions};
use arbor_db::{assistants, runs, threads, StoreError};
use arbor_graph::StateUpdate;
use arbor_schemas::ControlAction;

use crate::api_types::*;
use crate::state::AppState;

/// How long one SSE poll blocks before falling back to a status check.
const SSE_WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Wrapper mapping repository errors onto HTTP statuses.
pub(crate) struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Conflict(_) => StatusCode::CONFLICT,
            StoreError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            StoreError::Aborted(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(err = %self.0, "internal error");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/runs", post(create_run))
        .route("/runs/:run_id/stream", get(stream_run))
        .route("/runs/:run_id/cancel", post(cancel_run))
        .route("/runs/:run_id/join", get(join_run))
        .route("/assistants", post(create_assistant))
        .route("/assistants/search", post(search_assistants))
        .route(
            "/assistants/:assistant_id",
            get(get_assistant)
                .patch(patch_assistant)
                .delete(delete_assistant),
        )
        .route("/assistants/:assistant_id/versions", get(assistant_versions))
        .route("/assistants/:assistant_id/latest", post(set_latest_assistant))
        .route("/threads", post(create_thread))
        .route("/threads/search", post(search_threads))
        .route(
            "/threads/:thread_id",
            get(get_thread).patch(patch_thread).delete(delete_thread),
        )
        .route("/threads/:thread_id/copy", post(copy_thread))
        .route("/threads/:thread_id/history", get(thread_history))
        .route(
            "/threads/:thread_id/state",
            get(get_thread_state).post(post_thread_state),
        )
        .route("/threads/:thread_id/state/bulk", post(bulk_thread_state))
        .route("/threads/:thread_id/runs", get(list_thread_runs))
        .route(
            "/threads/:thread_id/runs/:run_id",
            get(get_thread_run).delete(delete_thread_run),
        )
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// POST /runs
// ---------------------------------------------------------------------------

pub(crate) async fn create_run(
    State(st): State<Arc<AppState>>,
    Json(body): Json<RunCreate>,
) -> ApiResult<Response> {
    let run_id = Uuid::new_v4();
    let kwargs = json!({
        "input": body.input,
        "config": body.config,
        "context": body.context,
        "stream_mode": body.stream_mode,
        "stream_resumable": body.stream_resumable,
        "webhook": body.webhook,
        "temporary": body.temporary,
    });

    let opts = runs::PutRun {
        run_id,
        thread_id: body.thread_id,
        assistant_id: body.assistant_id,
        kwargs,
        metadata: body.metadata,
        multitask_strategy: body.multitask_strategy,
        if_not_exists: body.if_not_exists,
        after_seconds: body.after_seconds,
        prevent_insert_in_inflight: body.multitask_strategy
            == arbor_schemas::MultitaskStrategy::Reject,
        user_id: None,
    };

    let result = runs::put(&st.pool, st.auth.as_ref(), opts).await?;
    let Some(head) = result.first() else {
        return Err(StoreError::NotFound("thread").into());
    };
    if head.run_id != run_id {
        // Reject strategy: the inflight set came back without an insert.
        return Err(StoreError::Conflict(format!(
            "thread {} already has an inflight run",
            head.thread_id
        ))
        .into());
    }

    // Interrupt / rollback strategies displace the previously inflight runs.
    let strategy = body.multitask_strategy;
    let action = match strategy {
        arbor_schemas::MultitaskStrategy::Interrupt => Some(ControlAction::Interrupt),
        arbor_schemas::MultitaskStrategy::Rollback => Some(ControlAction::Rollback),
        _ => None,
    };
    if let Some(action) = action {
        let inflight: Vec<Uuid> = result.iter().skip(1).map(|run| run.run_id).collect();
        if !inflight.is_empty() {
            runs::cancel(
                &st.pool,
                st.auth.as_ref(),
                st.broker.as_ref(),
                Some(head.thread_id),
                &inflight,
                action,
            )
            .await?;
        }
    }

    info!(%run_id, thread_id = %head.thread_id, "run created");
    Ok((
        StatusCode::OK,
        Json(RunCreated {
            run_id,
            thread_id: head.thread_id,
        }),
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// GET /runs/{run_id}/stream  (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn stream_run(
    State(st): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
    request_headers: HeaderMap,
) -> ApiResult<Response> {
    // Visibility check up front; unknown / filtered runs are 404 before any
    // stream is opened.
    runs::get(&st.pool, st.auth.as_ref(), None, run_id).await?;

    let last_event_id = query.last_event_id.or_else(|| {
        request_headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
    });

    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let events = run_event_stream(st, run_id, last_event_id.unwrap_or(0));
    Ok((headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response())
}

/// Re-emit broker events as SSE frames until `done`, a terminal run
/// status, or an unrecoverable broker error.
fn run_event_stream(
    st: Arc<AppState>,
    run_id: Uuid,
    mut last: u64,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let cancel = CancelSignal::new();
        loop {
            let opts = GetOptions::new(SSE_WAIT).resume_after(last);
            match st.broker.get(run_id, opts, &cancel).await {
                Ok((seq, event)) => {
                    last = seq;
                    if event.is_control() {
                        if event.data == json!(ControlAction::Done.as_str()) {
                            yield Ok(Event::default().id(seq.to_string()).event("done").data("{}"));
                            break;
                        }
                        continue;
                    }
                    let name = event
                        .topic_suffix()
                        .strip_prefix("stream:")
                        .unwrap_or(event.topic_suffix())
                        .to_string();
                    let data = serde_json::to_string(&event.data)
                        .unwrap_or_else(|_| "null".to_string());
                    yield Ok(Event::default().id(seq.to_string()).event(name).data(data));
                }
                Err(BrokerError::Timeout) => {
                    // No producer activity; close out if the run is over.
                    match runs::fetch_status(&st.pool, run_id).await {
                        Ok(Some(status)) if status.is_terminal() => {
                            yield Ok(Event::default().event("done").data("{}"));
                            break;
                        }
                        Ok(Some(_)) => continue,
                        // Rolled back: the row is gone.
                        Ok(None) => {
                            yield Ok(Event::default().event("done").data("{}"));
                            break;
                        }
                        Err(err) => {
                            let data = json!({ "error": err.to_string() }).to_string();
                            yield Ok(Event::default().event("error").data(data));
                            break;
                        }
                    }
                }
                Err(err) => {
                    // Includes sequence gaps from a truncated distributed
                    // stream: surface one error frame and terminate.
                    let data = json!({ "error": err.to_string() }).to_string();
                    yield Ok(Event::default().event("error").data(data));
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// POST /runs/{run_id}/cancel
// ---------------------------------------------------------------------------

pub(crate) async fn cancel_run(
    State(st): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
    body: Option<Json<CancelRequest>>,
) -> ApiResult<StatusCode> {
    let action = match body.and_then(|Json(b)| b.action).as_deref() {
        None | Some("interrupt") => ControlAction::Interrupt,
        Some("rollback") => ControlAction::Rollback,
        Some(other) => {
            return Err(StoreError::Validation(format!("invalid cancel action: {other}")).into())
        }
    };

    runs::cancel(
        &st.pool,
        st.auth.as_ref(),
        st.broker.as_ref(),
        None,
        &[run_id],
        action,
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// GET /runs/{run_id}/join
// ---------------------------------------------------------------------------

pub(crate) async fn join_run(
    State(st): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let values = runs::join(&st.pool, st.auth.as_ref(), st.broker.as_ref(), None, run_id).await?;
    Ok(Json(values))
}

// ---------------------------------------------------------------------------
// Assistants
// ---------------------------------------------------------------------------

pub(crate) async fn create_assistant(
    State(st): State<Arc<AppState>>,
    Json(body): Json<AssistantCreate>,
) -> ApiResult<Json<arbor_schemas::Assistant>> {
    let assistant_id = body.assistant_id.unwrap_or_else(Uuid::new_v4);
    let assistant = assistants::put(
        &st.pool,
        st.auth.as_ref(),
        assistant_id,
        assistants::PutAssistant {
            graph_id: body.graph_id,
            name: body.name,
            description: body.description,
            config: body.config,
            context: body.context,
            metadata: body.metadata,
            if_exists: body.if_exists,
        },
    )
    .await?;
    Ok(Json(assistant))
}

pub(crate) async fn get_assistant(
    State(st): State<Arc<AppState>>,
    Path(assistant_id): Path<Uuid>,
) -> ApiResult<Json<arbor_schemas::Assistant>> {
    let assistant = assistants::get(&st.pool, st.auth.as_ref(), assistant_id).await?;
    Ok(Json(assistant))
}

pub(crate) async fn patch_assistant(
    State(st): State<Arc<AppState>>,
    Path(assistant_id): Path<Uuid>,
    Json(body): Json<AssistantPatch>,
) -> ApiResult<Json<arbor_schemas::Assistant>> {
    let assistant = assistants::patch(
        &st.pool,
        st.auth.as_ref(),
        assistant_id,
        assistants::PatchAssistant {
            graph_id: body.graph_id,
            name: body.name,
            description: body.description,
            config: body.config,
            context: body.context,
            metadata: body.metadata,
        },
    )
    .await?;
    Ok(Json(assistant))
}

pub(crate) async fn delete_assistant(
    State(st): State<Arc<AppState>>,
    Path(assistant_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    assistants::delete(&st.pool, st.auth.as_ref(), assistant_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn assistant_versions(
    State(st): State<Arc<AppState>>,
    Path(assistant_id): Path<Uuid>,
) -> ApiResult<Json<Vec<arbor_schemas::AssistantVersion>>> {
    let versions =
        assistants::get_versions(&st.pool, st.auth.as_ref(), assistant_id, None, None).await?;
    Ok(Json(versions))
}

pub(crate) async fn set_latest_assistant(
    State(st): State<Arc<AppState>>,
    Path(assistant_id): Path<Uuid>,
    Json(body): Json<SetLatest>,
) -> ApiResult<Json<arbor_schemas::Assistant>> {
    let assistant =
        assistants::set_latest(&st.pool, st.auth.as_ref(), assistant_id, body.version).await?;
    Ok(Json(assistant))
}

pub(crate) async fn search_assistants(
    State(st): State<Arc<AppState>>,
    Json(body): Json<AssistantSearch>,
) -> ApiResult<Response> {
    let (items, total) = assistants::search(
        &st.pool,
        st.auth.as_ref(),
        assistants::SearchAssistants {
            graph_id: body.graph_id,
            name: body.name,
            metadata: body.metadata,
            limit: body.limit,
            offset: body.offset,
            sort_by: body.sort_by,
            sort_order: body.sort_order,
        },
    )
    .await?;

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&total.to_string()) {
        headers.insert("X-Pagination-Total", value);
    }
    Ok((headers, Json(items)).into_response())
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

pub(crate) async fn create_thread(
    State(st): State<Arc<AppState>>,
    Json(body): Json<ThreadCreate>,
) -> ApiResult<Json<arbor_schemas::Thread>> {
    let thread_id = body.thread_id.unwrap_or_else(Uuid::new_v4);
    let thread = threads::put(
        &st.pool,
        st.auth.as_ref(),
        thread_id,
        threads::PutThread {
            config: body.config,
            metadata: body.metadata,
            if_exists: body.if_exists,
        },
    )
    .await?;
    Ok(Json(thread))
}

pub(crate) async fn get_thread(
    State(st): State<Arc<AppState>>,
    Path(thread_id): Path<Uuid>,
) -> ApiResult<Json<arbor_schemas::Thread>> {
    let thread = threads::get(&st.pool, st.auth.as_ref(), thread_id).await?;
    Ok(Json(thread))
}

pub(crate) async fn patch_thread(
    State(st): State<Arc<AppState>>,
    Path(thread_id): Path<Uuid>,
    Json(body): Json<ThreadPatch>,
) -> ApiResult<Json<arbor_schemas::Thread>> {
    let thread = threads::patch(
        &st.pool,
        st.auth.as_ref(),
        thread_id,
        threads::PatchThread {
            config: body.config,
            metadata: body.metadata,
        },
    )
    .await?;
    Ok(Json(thread))
}

pub(crate) async fn delete_thread(
    State(st): State<Arc<AppState>>,
    Path(thread_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    threads::delete(&st.pool, st.auth.as_ref(), st.store.as_ref(), thread_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn copy_thread(
    State(st): State<Arc<AppState>>,
    Path(thread_id): Path<Uuid>,
) -> ApiResult<Json<arbor_schemas::Thread>> {
    let copy = threads::copy(&st.pool, st.auth.as_ref(), st.store.as_ref(), thread_id).await?;
    Ok(Json(copy))
}

pub(crate) async fn thread_history(
    State(st): State<Arc<AppState>>,
    Path(thread_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<arbor_schemas::Checkpoint>>> {
    let history = threads::state_history(
        &st.pool,
        st.auth.as_ref(),
        st.store.as_ref(),
        thread_id,
        query.limit,
    )
    .await?;
    Ok(Json(history))
}

pub(crate) async fn search_threads(
    State(st): State<Arc<AppState>>,
    Json(body): Json<ThreadSearch>,
) -> ApiResult<Response> {
    let (items, total) = threads::search(
        &st.pool,
        st.auth.as_ref(),
        threads::SearchThreads {
            status: body.status,
            metadata: body.metadata,
            limit: body.limit,
            offset: body.offset,
            sort_by: body.sort_by,
            sort_order: body.sort_order,
        },
    )
    .await?;

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&total.to_string()) {
        headers.insert("X-Pagination-Total", value);
    }
    Ok((headers, Json(items)).into_response())
}

// ---------------------------------------------------------------------------
// Thread state
// ---------------------------------------------------------------------------

pub(crate) async fn get_thread_state(
    State(st): State<Arc<AppState>>,
    Path(thread_id): Path<Uuid>,
) -> ApiResult<Json<Option<arbor_schemas::Checkpoint>>> {
    let state =
        threads::state_get(&st.pool, st.auth.as_ref(), st.store.as_ref(), thread_id).await?;
    Ok(Json(state))
}

pub(crate) async fn post_thread_state(
    State(st): State<Arc<AppState>>,
    Path(thread_id): Path<Uuid>,
    Json(body): Json<StateUpdateRequest>,
) -> ApiResult<Json<arbor_schemas::Checkpoint>> {
    let checkpoint = threads::state_post(
        &st.pool,
        st.auth.as_ref(),
        st.store.as_ref(),
        thread_id,
        StateUpdate {
            values: body.values,
            as_node: body.as_node,
        },
    )
    .await?;
    Ok(Json(checkpoint))
}

pub(crate) async fn bulk_thread_state(
    State(st): State<Arc<AppState>>,
    Path(thread_id): Path<Uuid>,
    Json(body): Json<BulkStateRequest>,
) -> ApiResult<Json<arbor_schemas::Checkpoint>> {
    let updates = body
        .updates
        .into_iter()
        .map(|u| StateUpdate {
            values: u.values,
            as_node: u.as_node,
        })
        .collect();
    let checkpoint = threads::state_bulk(
        &st.pool,
        st.auth.as_ref(),
        st.store.as_ref(),
        thread_id,
        updates,
    )
    .await?;
    Ok(Json(checkpoint))
}

// ---------------------------------------------------------------------------
// Runs under a thread
// ---------------------------------------------------------------------------

pub(crate) async fn list_thread_runs(
    State(st): State<Arc<AppState>>,
    Path(thread_id): Path<Uuid>,
) -> ApiResult<Json<Vec<arbor_schemas::Run>>> {
    let items = runs::list(&st.pool, st.auth.as_ref(), thread_id, None, None).await?;
    Ok(Json(items))
}

pub(crate) async fn get_thread_run(
    State(st): State<Arc<AppState>>,
    Path((thread_id, run_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<arbor_schemas::Run>> {
    let run = runs::get(&st.pool, st.auth.as_ref(), Some(thread_id), run_id).await?;
    Ok(Json(run))
}

pub(crate) async fn delete_thread_run(
    State(st): State<Arc<AppState>>,
    Path((thread_id, run_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    runs::delete(&st.pool, st.auth.as_ref(), Some(thread_id), run_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

pub(crate) async fn health_live(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(LiveResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

pub(crate) async fn health_ready(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let postgres = sqlx::query("select 1").execute(&st.pool).await.is_ok();
    let redis = if st.distributed {
        Some(st.broker.ready().await)
    } else {
        None
    };
    let checkpointer = st.store.ready().await;

    let healthy = postgres && checkpointer && redis.unwrap_or(true);
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyResponse {
            status: if healthy { "ready" } else { "unhealthy" },
            checks: ReadyChecks {
                postgres,
                redis,
                checkpointer,
            },
        }),
    )
}
