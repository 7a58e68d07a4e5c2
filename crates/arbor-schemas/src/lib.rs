use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod json;

pub use json::{json_contains, merge_json};

// -----------------------------
// Assistants
// -----------------------------

/// A bound configuration of a graph. Runs target an assistant rather than
/// the graph directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assistant {
    pub assistant_id: Uuid,
    pub graph_id: String,
    pub name: String,
    pub description: Option<String>,
    pub config: Value,
    pub context: Option<Value>,
    pub metadata: Value,
    /// Current version; every version 1..=version has a row in
    /// `assistant_versions`.
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable snapshot of an assistant at one version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantVersion {
    pub assistant_id: Uuid,
    pub version: i32,
    pub graph_id: String,
    pub name: String,
    pub description: Option<String>,
    pub config: Value,
    pub context: Option<Value>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Conflict policy for `assistants.put` on an existing id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IfExists {
    #[default]
    Raise,
    DoNothing,
}

// -----------------------------
// Threads
// -----------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Idle,
    Busy,
    Interrupted,
    Error,
}

impl ThreadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadStatus::Idle => "idle",
            ThreadStatus::Busy => "busy",
            ThreadStatus::Interrupted => "interrupted",
            ThreadStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(ThreadStatus::Idle),
            "busy" => Ok(ThreadStatus::Busy),
            "interrupted" => Ok(ThreadStatus::Interrupted),
            "error" => Ok(ThreadStatus::Error),
            other => Err(anyhow!("invalid thread status: {}", other)),
        }
    }
}

/// An ongoing conversational context. Owns the accumulated checkpoint
/// history and current state values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub thread_id: Uuid,
    pub status: ThreadStatus,
    pub config: Value,
    pub metadata: Value,
    /// Last known state values, copied from the latest checkpoint.
    pub values: Option<Value>,
    /// `task_id -> interrupt payload` for tasks paused awaiting input.
    pub interrupts: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// -----------------------------
// Runs
// -----------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Error,
    Interrupted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
            RunStatus::Interrupted => "interrupted",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "error" => Ok(RunStatus::Error),
            "interrupted" => Ok(RunStatus::Interrupted),
            other => Err(anyhow!("invalid run status: {}", other)),
        }
    }

    /// Terminal statuses never transition again (except rollback deletion).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Error | RunStatus::Interrupted
        )
    }
}

/// Policy for what to do when a new run arrives for a thread already
/// inflight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MultitaskStrategy {
    #[default]
    Reject,
    Rollback,
    Interrupt,
    Enqueue,
}

impl MultitaskStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MultitaskStrategy::Reject => "reject",
            MultitaskStrategy::Rollback => "rollback",
            MultitaskStrategy::Interrupt => "interrupt",
            MultitaskStrategy::Enqueue => "enqueue",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "reject" => Ok(MultitaskStrategy::Reject),
            "rollback" => Ok(MultitaskStrategy::Rollback),
            "interrupt" => Ok(MultitaskStrategy::Interrupt),
            "enqueue" => Ok(MultitaskStrategy::Enqueue),
            other => Err(anyhow!("invalid multitask strategy: {}", other)),
        }
    }
}

/// One execution of a graph against a thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub thread_id: Uuid,
    pub assistant_id: Uuid,
    pub status: RunStatus,
    pub metadata: Value,
    /// Execution arguments handed to the graph runner: input, config,
    /// stream modes, webhook, temporary flag.
    pub kwargs: Value,
    pub multitask_strategy: MultitaskStrategy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// Attempt counter key inside `metadata`, incremented atomically on each
    /// scheduler claim.
    pub fn retry_key(run_id: Uuid) -> String {
        format!("retry:{run_id}")
    }

    pub fn attempt(&self) -> i64 {
        self.metadata
            .get(Self::retry_key(self.run_id))
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }
}

/// Out-of-band instruction delivered to the worker executing a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Interrupt,
    Rollback,
    /// Internal: posted by the worker when a run reaches a terminal status.
    Done,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::Interrupt => "interrupt",
            ControlAction::Rollback => "rollback",
            ControlAction::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "interrupt" => Ok(ControlAction::Interrupt),
            "rollback" => Ok(ControlAction::Rollback),
            "done" => Ok(ControlAction::Done),
            other => Err(anyhow!("invalid control action: {}", other)),
        }
    }
}

// -----------------------------
// Checkpoints
// -----------------------------

/// One logical unit of work inside a checkpoint; may carry interrupt
/// payloads for tasks paused awaiting external input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointTask {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub interrupts: Vec<Value>,
    #[serde(default)]
    pub result: Option<Value>,
}

/// Immutable snapshot of graph state at a superstep boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub thread_id: Uuid,
    pub values: Value,
    /// Node names scheduled for the next superstep. Nonempty means the run
    /// paused mid-graph (interrupted).
    #[serde(default)]
    pub next: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<CheckpointTask>,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Reduce `tasks` into the thread's `interrupts` mapping
    /// (`task_id -> interrupt payload`). Tasks without interrupts are
    /// omitted.
    pub fn interrupts(&self) -> Value {
        let mut map = serde_json::Map::new();
        for task in &self.tasks {
            if !task.interrupts.is_empty() {
                map.insert(task.id.clone(), Value::Array(task.interrupts.clone()));
            }
        }
        Value::Object(map)
    }
}

// -----------------------------
// Stream events
// -----------------------------

/// One event on a run's ordered log. `seq` is assigned by the broker and
/// strictly increases per run starting at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// `run:<run_id>:stream:<event>` or `run:<run_id>:control`.
    pub topic: String,
    pub data: Value,
}

impl StreamEvent {
    pub fn stream(run_id: Uuid, event: &str, data: Value) -> Self {
        Self {
            topic: format!("run:{run_id}:stream:{event}"),
            data,
        }
    }

    pub fn control(run_id: Uuid, action: ControlAction) -> Self {
        Self {
            topic: format!("run:{run_id}:control"),
            data: Value::String(action.as_str().to_string()),
        }
    }

    /// The suffix after `run:<id>:` — `stream:<event>` or `control`.
    pub fn topic_suffix(&self) -> &str {
        self.topic
            .splitn(3, ':')
            .nth(2)
            .unwrap_or(self.topic.as_str())
    }

    pub fn is_control(&self) -> bool {
        self.topic.ends_with(":control")
    }
}
