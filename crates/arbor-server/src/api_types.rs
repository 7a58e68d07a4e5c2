//! Request / response DTOs for the HTTP surface.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use arbor_db::assistants::SortOrder;
use arbor_db::runs::IfNotExists;
use arbor_schemas::{IfExists, MultitaskStrategy, ThreadStatus};

fn default_object() -> Value {
    Value::Object(serde_json::Map::new())
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RunCreate {
    pub assistant_id: Uuid,
    #[serde(default)]
    pub thread_id: Option<Uuid>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default = "default_object")]
    pub metadata: Value,
    #[serde(default)]
    pub stream_mode: Vec<String>,
    #[serde(default)]
    pub stream_resumable: bool,
    #[serde(default)]
    pub multitask_strategy: MultitaskStrategy,
    #[serde(default)]
    pub if_not_exists: IfNotExists,
    #[serde(default)]
    pub after_seconds: i64,
    #[serde(default)]
    pub webhook: Option<String>,
    /// Delete the thread after the run finishes.
    #[serde(default)]
    pub temporary: bool,
}

#[derive(Debug, Serialize)]
pub struct RunCreated {
    pub run_id: Uuid,
    pub thread_id: Uuid,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    /// "interrupt" (default) or "rollback".
    #[serde(default)]
    pub action: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub last_event_id: Option<u64>,
}

// ---------------------------------------------------------------------------
// Assistants
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AssistantCreate {
    #[serde(default)]
    pub assistant_id: Option<Uuid>,
    pub graph_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_object")]
    pub config: Value,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default = "default_object")]
    pub metadata: Value,
    #[serde(default)]
    pub if_exists: IfExists,
}

#[derive(Debug, Default, Deserialize)]
pub struct AssistantPatch {
    #[serde(default)]
    pub graph_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AssistantSearch {
    #[serde(default)]
    pub graph_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub sort_order: SortOrder,
}

#[derive(Debug, Deserialize)]
pub struct SetLatest {
    pub version: i32,
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ThreadCreate {
    #[serde(default)]
    pub thread_id: Option<Uuid>,
    #[serde(default = "default_object")]
    pub config: Value,
    #[serde(default = "default_object")]
    pub metadata: Value,
    #[serde(default)]
    pub if_exists: IfExists,
}

#[derive(Debug, Default, Deserialize)]
pub struct ThreadPatch {
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ThreadSearch {
    #[serde(default)]
    pub status: Option<ThreadStatus>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub sort_order: SortOrder,
}

#[derive(Debug, Deserialize)]
pub struct StateUpdateRequest {
    pub values: Value,
    #[serde(default)]
    pub as_node: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BulkStateRequest {
    pub updates: Vec<StateUpdateRequest>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ReadyChecks {
    pub postgres: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<bool>,
    pub checkpointer: bool,
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    /// "ready" or "unhealthy".
    pub status: &'static str,
    pub checks: ReadyChecks,
}

#[derive(Debug, Serialize)]
pub struct LiveResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
