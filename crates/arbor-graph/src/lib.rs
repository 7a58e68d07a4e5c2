//! Abstract seams to the graph executor and the checkpoint store.
//!
//! The run server never interprets graph events; it drains them into the
//! stream broker. Likewise it never stores checkpoints itself; thread state
//! reads and writes delegate to a [`CheckpointStore`].

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;
use uuid::Uuid;

use arbor_broker::CancelSignal;
use arbor_schemas::{Checkpoint, Run};

/// Lazy sequence of `(event, data)` pairs produced by one graph execution.
pub type EventStream = BoxStream<'static, Result<(String, Value)>>;

/// Everything a [`GraphRunner`] needs while executing one claimed run.
#[derive(Clone)]
pub struct RunContext {
    pub attempt: i64,
    /// Abort channel; the runner must observe it at its next suspension
    /// point.
    pub cancel: CancelSignal,
    /// Sink for checkpoint / task-result emissions; the worker reads the
    /// latest checkpoint from it for thread status derivation.
    pub tracker: CheckpointTracker,
}

/// Executes a named computation graph against a thread. Deterministic per
/// `(input, checkpoint_id, attempt)` up to graph non-determinism.
#[async_trait]
pub trait GraphRunner: Send + Sync {
    async fn run(&self, run: &Run, ctx: RunContext) -> Result<EventStream>;
}

/// A single state update applied to a thread (bulk form of `update_state`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StateUpdate {
    pub values: Value,
    /// Node the update is attributed to, if any.
    #[serde(default)]
    pub as_node: Option<String>,
}

/// Stores and fetches graph checkpoints per thread.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Latest checkpoint for the thread, if it has one.
    async fn get_state(&self, thread_id: Uuid) -> Result<Option<Checkpoint>>;

    /// Apply one state update and return the resulting checkpoint.
    async fn update_state(&self, thread_id: Uuid, update: StateUpdate) -> Result<Checkpoint>;

    /// Apply a batch of updates atomically, returning the final checkpoint.
    async fn bulk_update_state(
        &self,
        thread_id: Uuid,
        updates: Vec<StateUpdate>,
    ) -> Result<Checkpoint>;

    /// Checkpoints newest-first.
    async fn get_state_history(
        &self,
        thread_id: Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<Checkpoint>>;

    /// Duplicate every checkpoint of `source` onto `target`.
    async fn copy_thread(&self, source: Uuid, target: Uuid) -> Result<()>;

    /// Remove all checkpoints for the thread.
    async fn delete_thread(&self, thread_id: Uuid) -> Result<()>;

    /// Connectivity probe for the readiness endpoint.
    async fn ready(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// CheckpointTracker
// ---------------------------------------------------------------------------

/// Holds the most recent checkpoint emitted during a run, with task results
/// patched in as they arrive. Shared between the runner (writer) and the
/// worker (reader at completion).
#[derive(Clone, Default)]
pub struct CheckpointTracker {
    latest: Arc<Mutex<Option<Checkpoint>>>,
}

impl CheckpointTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit_checkpoint(&self, checkpoint: Checkpoint) {
        *self.latest.lock().expect("checkpoint tracker poisoned") = Some(checkpoint);
    }

    /// Patch the matching task of the tracked checkpoint with its result.
    /// A result for an unknown task is dropped.
    pub fn emit_task_result(&self, task_id: &str, result: Value) {
        let mut latest = self.latest.lock().expect("checkpoint tracker poisoned");
        if let Some(checkpoint) = latest.as_mut() {
            if let Some(task) = checkpoint.tasks.iter_mut().find(|t| t.id == task_id) {
                task.result = Some(result);
            }
        }
    }

    pub fn latest(&self) -> Option<Checkpoint> {
        self.latest
            .lock()
            .expect("checkpoint tracker poisoned")
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_schemas::CheckpointTask;
    use chrono::Utc;
    use serde_json::json;

    fn checkpoint_with_task(task_id: &str) -> Checkpoint {
        Checkpoint {
            checkpoint_id: "cp-1".into(),
            thread_id: Uuid::new_v4(),
            values: json!({"count": 1}),
            next: vec![],
            tasks: vec![CheckpointTask {
                id: task_id.into(),
                name: "step".into(),
                error: None,
                interrupts: vec![],
                result: None,
            }],
            metadata: json!({}),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn tracker_keeps_latest_checkpoint() {
        let tracker = CheckpointTracker::new();
        assert!(tracker.latest().is_none());

        tracker.emit_checkpoint(checkpoint_with_task("t1"));
        let mut second = checkpoint_with_task("t1");
        second.checkpoint_id = "cp-2".into();
        tracker.emit_checkpoint(second);

        assert_eq!(tracker.latest().unwrap().checkpoint_id, "cp-2");
    }

    #[test]
    fn task_results_patch_matching_task_only() {
        let tracker = CheckpointTracker::new();
        tracker.emit_checkpoint(checkpoint_with_task("t1"));

        tracker.emit_task_result("t1", json!({"ok": true}));
        tracker.emit_task_result("ghost", json!({"ok": false}));

        let latest = tracker.latest().unwrap();
        assert_eq!(latest.tasks[0].result, Some(json!({"ok": true})));
        assert_eq!(latest.tasks.len(), 1);
    }
}
