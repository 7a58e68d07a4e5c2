//! Per-run ordered event log with blocking readers, plus the run lock /
//! control-signal plane used for cross-process cancellation.
//!
//! Two implementations share one contract: [`MemoryBroker`] for single
//! process deployments and [`RedisBroker`] when `REDIS_URL` is configured.

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use arbor_schemas::{ControlAction, StreamEvent};

mod memory;
mod redis_broker;
mod signal;

pub use memory::MemoryBroker;
pub use redis_broker::RedisBroker;
pub use signal::CancelSignal;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// No event arrived within the caller's timeout.
    #[error("timed out waiting for stream event")]
    Timeout,
    /// The caller's cancel token fired while waiting.
    #[error("stream wait cancelled")]
    Cancelled,
    /// The log was truncated under the reader (distributed stream TTL);
    /// subscribers must surface an error event and terminate.
    #[error("gap in stream sequence: expected {expected}, log starts at {found}")]
    Gap { expected: u64, found: u64 },
    /// Attempted to lock a run that is already claimed.
    #[error("run {0} is already locked")]
    AlreadyLocked(Uuid),
    #[error("broker transport error: {0}")]
    Transport(#[from] redis::RedisError),
    #[error("broker codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Options for a blocking [`StreamBroker::get`].
#[derive(Debug, Clone, Copy)]
pub struct GetOptions {
    pub timeout: Duration,
    /// Resume after this sequence id. Only honored for resumable queues;
    /// ids past the end of the log behave as if absent.
    pub last_event_id: Option<u64>,
}

impl GetOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_event_id: None,
        }
    }

    pub fn resume_after(mut self, last_event_id: u64) -> Self {
        self.last_event_id = Some(last_event_id);
        self
    }
}

/// Central stream/control contract (single producer per run, many readers).
#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Create the run's queue if absent. `resumable` queues retain the full
    /// log for the run's lifetime; non-resumable queues drain on read.
    async fn get_queue(&self, run_id: Uuid, resumable: bool);

    /// Append an event, returning its sequence id (monotonic per run,
    /// starting at 1). Only the worker owning the run should push.
    async fn push(&self, run_id: Uuid, event: StreamEvent) -> Result<u64, BrokerError>;

    /// Block up to `opts.timeout` for the next event, observing `cancel`.
    async fn get(
        &self,
        run_id: Uuid,
        opts: GetOptions,
        cancel: &CancelSignal,
    ) -> Result<(u64, StreamEvent), BrokerError>;

    /// Acquire the run's execution lock, yielding its cancellation signal.
    /// Fails with [`BrokerError::AlreadyLocked`] if another claimant holds it.
    async fn lock(&self, run_id: Uuid) -> Result<CancelSignal, BrokerError>;

    /// Release the run's lock and tear down its control subscription.
    async fn unlock(&self, run_id: Uuid);

    async fn is_locked(&self, run_id: Uuid) -> bool;

    /// The current lock's signal, if the run is locked in this process.
    async fn get_control(&self, run_id: Uuid) -> Option<CancelSignal>;

    /// Abort the lock holder's `CancelSignal` with `action` — the local
    /// holder directly, remote holders through their control
    /// subscriptions. The stream log is untouched; subscribers learn the
    /// outcome from the terminal events the worker publishes.
    async fn publish_control(
        &self,
        run_id: Uuid,
        action: ControlAction,
    ) -> Result<(), BrokerError>;

    /// Drop the run's queue once the run is finished and all readers are
    /// done with it.
    async fn drop_queue(&self, run_id: Uuid);

    /// Connectivity probe for the readiness endpoint.
    async fn ready(&self) -> bool;
}
