//! Cancellation signal attached to a run's execution lock.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use arbor_schemas::ControlAction;

/// Cooperative abort channel for one run. Cloning shares the underlying
/// token, so a signal handed to the worker and one held by the broker's
/// control subscription observe the same abort.
///
/// The reason is write-once: the first `abort` wins and later actions are
/// ignored, so a rollback arriving after an interrupt cannot flip the
/// worker's terminal handling mid-teardown.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<ControlAction>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
        }
    }

    /// Abort with `action`. Idempotent; only the first reason is kept.
    pub fn abort(&self, action: ControlAction) {
        let _ = self.reason.set(action);
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The abort reason, once aborted.
    pub fn reason(&self) -> Option<ControlAction> {
        self.reason.get().copied()
    }

    /// Resolves when the signal aborts. Safe to poll from multiple tasks.
    pub async fn aborted(&self) {
        self.token.cancelled().await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}
