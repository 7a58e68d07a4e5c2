//! Built-in fallback graph: echoes the run input back as state.
//!
//! Deployments register real graph runners through [`crate::state::AppState`];
//! this one keeps a bare server bootable for smoke tests and local
//! development.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use arbor_graph::{EventStream, GraphRunner, RunContext};
use arbor_schemas::{Checkpoint, Run};

pub struct EchoGraph;

#[async_trait]
impl GraphRunner for EchoGraph {
    async fn run(&self, run: &Run, ctx: RunContext) -> Result<EventStream> {
        let input = run
            .kwargs
            .get("input")
            .cloned()
            .unwrap_or(Value::Null);
        let thread_id = run.thread_id;
        let attempt = ctx.attempt;

        let stream = async_stream::try_stream! {
            yield (
                "metadata".to_string(),
                json!({ "attempt": attempt }),
            );

            let values = json!({ "echo": input });
            ctx.tracker.emit_checkpoint(Checkpoint {
                checkpoint_id: format!("echo-{thread_id}"),
                thread_id,
                values: values.clone(),
                next: vec![],
                tasks: vec![],
                metadata: json!({}),
                created_at: Utc::now(),
            });
            yield ("values".to_string(), values);
        };
        Ok(Box::pin(stream))
    }
}
