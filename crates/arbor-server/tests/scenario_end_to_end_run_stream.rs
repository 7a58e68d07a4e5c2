//! Full-stack scenario: queue workers + notifier + HTTP surface in one
//! process. A created run is claimed, executed by the built-in echo graph,
//! joined for its final values, and replayed over SSE.
//!
//! Skips when DATABASE_URL is not set.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt; // oneshot

use arbor_broker::{CancelSignal, MemoryBroker, StreamBroker};
use arbor_db::{channel_name, AllowAll, Notifier};
use arbor_graph::CheckpointStore;
use arbor_queue::{supervisor, worker::WorkerDeps, QueueConfig};
use arbor_schemas::ControlAction;
use arbor_server::{echo::EchoGraph, routes, state::AppState};
use arbor_testkit::MemoryCheckpoints;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn run_executes_streams_and_joins() -> anyhow::Result<()> {
    let Some(pool) = arbor_testkit::try_db_pool().await else {
        eprintln!("SKIP: DATABASE_URL not set");
        return Ok(());
    };

    let broker: Arc<dyn StreamBroker> = Arc::new(MemoryBroker::new());
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpoints::new());
    let deps = WorkerDeps {
        pool: pool.clone(),
        broker: Arc::clone(&broker),
        runner: Arc::new(EchoGraph),
        store: Arc::clone(&store),
        http: arbor_queue::worker::webhook_client(),
    };

    let notifier = Arc::new(
        Notifier::start(&pool, &channel_name(None))
            .await
            .expect("notifier start"),
    );
    let shutdown = CancelSignal::new();
    let queue = supervisor::start(
        QueueConfig { workers: 2 },
        deps,
        Arc::clone(&notifier),
        shutdown.clone(),
    );

    let st = Arc::new(AppState::new(
        pool.clone(),
        Arc::clone(&broker),
        Arc::new(EchoGraph),
        store,
        Arc::new(AllowAll),
        false,
    ));
    let router = routes::build_router(Arc::clone(&st));

    // Create the assistant and a resumable run through the API.
    let (status, body) = call(
        router.clone(),
        post_json("/assistants", json!({"graph_id": "agent"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let assistant_id = body["assistant_id"].as_str().unwrap().to_string();

    let (status, body) = call(
        router.clone(),
        post_json(
            "/runs",
            json!({
                "assistant_id": assistant_id,
                "input": {"q": "ping"},
                "stream_resumable": true,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let run_id = body["run_id"].as_str().unwrap().to_string();
    let thread_id = body["thread_id"].as_str().unwrap().to_string();

    // Join blocks until the workers finish the run and returns the final
    // values payload.
    let (status, values) = tokio::time::timeout(
        Duration::from_secs(20),
        call(router.clone(), get(&format!("/runs/{run_id}/join"))),
    )
    .await
    .expect("join must complete once a worker picks up the run");
    assert_eq!(status, StatusCode::OK);
    assert_eq!(values, json!({"echo": {"q": "ping"}}));

    let (status, run) = call(
        router.clone(),
        get(&format!("/threads/{thread_id}/runs/{run_id}")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["status"], "success");

    let (status, thread) = call(router.clone(), get(&format!("/threads/{thread_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(thread["status"], "idle");
    assert_eq!(thread["values"], json!({"echo": {"q": "ping"}}));

    // A late SSE subscriber replays the whole stream and terminates on the
    // done frame.
    let request = get(&format!("/runs/{run_id}/stream?last_event_id=0"));
    let response = router.clone().oneshot(request).await.expect("oneshot");
    assert_eq!(response.status(), StatusCode::OK);
    let raw = response
        .into_body()
        .collect()
        .await
        .expect("collect sse body")
        .to_bytes();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.contains("event: metadata"), "frames: {text}");
    assert!(text.contains("event: values"), "frames: {text}");
    assert!(text.contains("event: done"), "frames: {text}");
    assert!(text.contains("id: 1"), "frames: {text}");

    // Unknown run ids 404 before any stream opens.
    let request = get(&format!("/runs/{}/stream", uuid::Uuid::new_v4()));
    let response = router.clone().oneshot(request).await.expect("oneshot");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    shutdown.abort(ControlAction::Interrupt);
    for handle in queue.workers {
        handle.abort();
    }
    queue.sweeper.abort();
    Ok(())
}

async fn call(router: axum::Router, req: Request<axum::body::Body>) -> (StatusCode, Value) {
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn post_json(uri: &str, body: Value) -> Request<axum::body::Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<axum::body::Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap()
}
