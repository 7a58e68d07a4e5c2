//! Test fixtures: a scripted graph runner, an in-memory checkpoint store,
//! and env-gated connection helpers for the scenario tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use arbor_graph::{CheckpointStore, EventStream, GraphRunner, RunContext, StateUpdate};
use arbor_schemas::{merge_json, Checkpoint, Run};

// ---------------------------------------------------------------------------
// Env-gated connections
// ---------------------------------------------------------------------------

/// Connect and migrate against DATABASE_URL, or `None` when unset /
/// unreachable so callers can skip (local + CI friendly).
pub async fn try_db_pool() -> Option<PgPool> {
    let url = std::env::var(arbor_db::ENV_DB_URL).ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .ok()?;
    arbor_db::migrate(&pool).await.ok()?;
    Some(pool)
}

/// REDIS_URL when set; tests needing the distributed broker skip otherwise.
pub fn try_redis_url() -> Option<String> {
    std::env::var("REDIS_URL").ok()
}

// ---------------------------------------------------------------------------
// ScriptedRunner
// ---------------------------------------------------------------------------

/// One step of a scripted graph execution.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Yield `(event, data)` to the worker.
    Emit { event: String, data: Value },
    /// Record a checkpoint on the run context (also emitted as an event).
    Checkpoint { values: Value, next: Vec<String> },
    /// Simulate graph latency; the abort signal is observed here.
    Sleep(Duration),
    /// Fail the run.
    Fail(String),
}

impl ScriptStep {
    pub fn emit(event: &str, data: Value) -> Self {
        ScriptStep::Emit {
            event: event.to_string(),
            data,
        }
    }
}

/// Deterministic [`GraphRunner`] driven by a fixed script.
#[derive(Default)]
pub struct ScriptedRunner {
    steps: Vec<ScriptStep>,
}

impl ScriptedRunner {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self { steps }
    }

    /// A run that emits `count` values events and completes cleanly.
    pub fn completing(count: usize) -> Self {
        let steps = (1..=count)
            .map(|n| ScriptStep::emit("values", json!({ "step": n })))
            .chain(std::iter::once(ScriptStep::Checkpoint {
                values: json!({ "steps": count }),
                next: vec![],
            }))
            .collect();
        Self::new(steps)
    }
}

#[async_trait]
impl GraphRunner for ScriptedRunner {
    async fn run(&self, run: &Run, ctx: RunContext) -> Result<EventStream> {
        let steps = self.steps.clone();
        let thread_id = run.thread_id;

        let stream = async_stream::try_stream! {
            for (index, step) in steps.into_iter().enumerate() {
                if ctx.cancel.is_aborted() {
                    Err(anyhow!("run aborted"))?;
                }
                match step {
                    ScriptStep::Emit { event, data } => {
                        yield (event, data);
                    }
                    ScriptStep::Checkpoint { values, next } => {
                        let checkpoint = Checkpoint {
                            checkpoint_id: format!("cp-{index}"),
                            thread_id,
                            values: values.clone(),
                            next,
                            tasks: vec![],
                            metadata: json!({}),
                            created_at: Utc::now(),
                        };
                        ctx.tracker.emit_checkpoint(checkpoint);
                        yield ("checkpoint".to_string(), values);
                    }
                    ScriptStep::Sleep(duration) => {
                        tokio::select! {
                            _ = tokio::time::sleep(duration) => {}
                            _ = ctx.cancel.aborted() => {}
                        }
                        if ctx.cancel.is_aborted() {
                            Err(anyhow!("run aborted"))?;
                        }
                    }
                    ScriptStep::Fail(message) => {
                        Err(anyhow!(message))?;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

// ---------------------------------------------------------------------------
// MemoryCheckpoints
// ---------------------------------------------------------------------------

/// In-memory [`CheckpointStore`]; state updates append checkpoints whose
/// values merge over the previous ones.
#[derive(Default)]
pub struct MemoryCheckpoints {
    threads: Mutex<HashMap<Uuid, Vec<Checkpoint>>>,
}

impl MemoryCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }

    fn append(&self, thread_id: Uuid, values: Value) -> Checkpoint {
        let mut threads = self.threads.lock().expect("checkpoint store poisoned");
        let history = threads.entry(thread_id).or_default();
        let merged = history
            .last()
            .map(|cp| merge_json(&cp.values, &values))
            .unwrap_or(values);
        let checkpoint = Checkpoint {
            checkpoint_id: format!("cp-{}", history.len() + 1),
            thread_id,
            values: merged,
            next: vec![],
            tasks: vec![],
            metadata: json!({}),
            created_at: Utc::now(),
        };
        history.push(checkpoint.clone());
        checkpoint
    }

    /// Seed a checkpoint directly (e.g. to fake a finished run).
    pub fn seed(&self, checkpoint: Checkpoint) {
        self.threads
            .lock()
            .expect("checkpoint store poisoned")
            .entry(checkpoint.thread_id)
            .or_default()
            .push(checkpoint);
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpoints {
    async fn get_state(&self, thread_id: Uuid) -> Result<Option<Checkpoint>> {
        Ok(self
            .threads
            .lock()
            .expect("checkpoint store poisoned")
            .get(&thread_id)
            .and_then(|history| history.last().cloned()))
    }

    async fn update_state(&self, thread_id: Uuid, update: StateUpdate) -> Result<Checkpoint> {
        Ok(self.append(thread_id, update.values))
    }

    async fn bulk_update_state(
        &self,
        thread_id: Uuid,
        updates: Vec<StateUpdate>,
    ) -> Result<Checkpoint> {
        let mut last = None;
        for update in updates {
            last = Some(self.append(thread_id, update.values));
        }
        last.ok_or_else(|| anyhow!("bulk update requires at least one update"))
    }

    async fn get_state_history(
        &self,
        thread_id: Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<Checkpoint>> {
        let threads = self.threads.lock().expect("checkpoint store poisoned");
        let mut history: Vec<Checkpoint> = threads
            .get(&thread_id)
            .map(|h| h.iter().rev().cloned().collect())
            .unwrap_or_default();
        if let Some(limit) = limit {
            history.truncate(limit);
        }
        Ok(history)
    }

    async fn copy_thread(&self, source: Uuid, target: Uuid) -> Result<()> {
        let mut threads = self.threads.lock().expect("checkpoint store poisoned");
        let copied: Vec<Checkpoint> = threads
            .get(&source)
            .map(|history| {
                history
                    .iter()
                    .cloned()
                    .map(|mut cp| {
                        cp.thread_id = target;
                        cp
                    })
                    .collect()
            })
            .unwrap_or_default();
        threads.insert(target, copied);
        Ok(())
    }

    async fn delete_thread(&self, thread_id: Uuid) -> Result<()> {
        self.threads
            .lock()
            .expect("checkpoint store poisoned")
            .remove(&thread_id);
        Ok(())
    }
}
