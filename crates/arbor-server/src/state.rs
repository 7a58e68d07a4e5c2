//! Shared runtime state for arbor-server. Handlers receive
//! `State<Arc<AppState>>` from Axum; this module owns nothing async itself.

use std::sync::Arc;

use sqlx::PgPool;

use arbor_broker::StreamBroker;
use arbor_db::AuthContext;
use arbor_graph::{CheckpointStore, GraphRunner};

/// Static build metadata included in health responses.
#[derive(Clone, Debug)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub broker: Arc<dyn StreamBroker>,
    pub runner: Arc<dyn GraphRunner>,
    pub store: Arc<dyn CheckpointStore>,
    pub auth: Arc<dyn AuthContext>,
    /// True when the distributed broker is in use; readiness then reports
    /// a redis check.
    pub distributed: bool,
    pub build: BuildInfo,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        broker: Arc<dyn StreamBroker>,
        runner: Arc<dyn GraphRunner>,
        store: Arc<dyn CheckpointStore>,
        auth: Arc<dyn AuthContext>,
        distributed: bool,
    ) -> Self {
        Self {
            pool,
            broker,
            runner,
            store,
            auth,
            distributed,
            build: BuildInfo {
                service: "arbor-server",
                version: env!("CARGO_PKG_VERSION"),
            },
        }
    }
}
