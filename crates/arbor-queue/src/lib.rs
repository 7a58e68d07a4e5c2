//! Run queue: claim scheduling, worker execution, the supervisor that
//! keeps N workers fed, and the orphan sweeper.

pub mod scheduler;
pub mod supervisor;
pub mod sweeper;
pub mod worker;

pub use scheduler::{next_run, ClaimedRun};
pub use supervisor::{QueueConfig, QueueHandles};
pub use worker::WorkerDeps;
