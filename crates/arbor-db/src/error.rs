//! Typed error taxonomy for the repository layer. API handlers map these
//! onto HTTP statuses; workers catch everything.

use arbor_broker::BrokerError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Missing entity, including authorization-filter mismatches (which are
    /// reported identically to avoid probing).
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation: {0}")]
    Validation(String),

    /// Run aborted by a control signal; never surfaces to clients as an
    /// error.
    #[error("run aborted: {0}")]
    Aborted(&'static str),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("json codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Row decode failures and other invariant breaks.
    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        StoreError::Internal(err.to_string())
    }
}
