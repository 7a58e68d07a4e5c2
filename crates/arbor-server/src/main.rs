//! arbor-server entry point.
//!
//! This file is intentionally thin: it sets up tracing, connects the pool,
//! picks the broker implementation, starts the queue, wires middleware, and
//! serves HTTP. All route handlers live in `routes.rs`; shared state types
//! live in `state.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

use arbor_broker::{CancelSignal, MemoryBroker, RedisBroker, StreamBroker};
use arbor_db::{channel_name, pool, AllowAll, Notifier};
use arbor_queue::{supervisor, worker::WorkerDeps, QueueConfig};
use arbor_schemas::ControlAction;
use arbor_server::{echo::EchoGraph, routes, state::AppState};
use arbor_testkit::MemoryCheckpoints;

const ENV_REDIS_URL: &str = "REDIS_URL";
const ENV_WORKERS: &str = "ARBOR_WORKERS";
const ENV_ADDR: &str = "ARBOR_ADDR";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let db_url = std::env::var(arbor_db::ENV_DB_URL)
        .with_context(|| format!("missing env var {}", arbor_db::ENV_DB_URL))?;
    pool::configure(&db_url, None)
        .await
        .map_err(|err| anyhow::anyhow!(err))?;
    let db = pool::get_pool().await.map_err(|err| anyhow::anyhow!(err))?;
    arbor_db::migrate(&db).await?;

    let (broker, distributed): (Arc<dyn StreamBroker>, bool) =
        match std::env::var(ENV_REDIS_URL).ok() {
            Some(url) => {
                info!("using distributed broker");
                (Arc::new(RedisBroker::connect(&url)?), true)
            }
            None => (Arc::new(MemoryBroker::new()), false),
        };

    let notifier = Arc::new(
        Notifier::start(&db, &channel_name(None))
            .await
            .map_err(|err| anyhow::anyhow!(err))?,
    );

    let deps = WorkerDeps {
        pool: db.clone(),
        broker: Arc::clone(&broker),
        runner: Arc::new(EchoGraph),
        store: Arc::new(MemoryCheckpoints::new()),
        http: arbor_queue::worker::webhook_client(),
    };

    let shutdown = CancelSignal::new();
    let queue = supervisor::start(
        QueueConfig {
            workers: workers_from_env(),
        },
        deps.clone(),
        Arc::clone(&notifier),
        shutdown.clone(),
    );

    let shared = Arc::new(AppState::new(
        db,
        broker,
        deps.runner,
        deps.store,
        Arc::new(AllowAll),
        distributed,
    ));

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 9123)));
    info!("arbor-server listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("server crashed")?;

    // Stop the workers at their next idle point, then drain the pool.
    shutdown.abort(ControlAction::Interrupt);
    for handle in queue.workers {
        handle.abort();
    }
    queue.sweeper.abort();
    tokio::time::sleep(Duration::from_millis(100)).await;
    pool::shutdown().await;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn workers_from_env() -> usize {
    std::env::var(ENV_WORKERS)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(10)
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var(ENV_ADDR).ok()?.parse().ok()
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}
