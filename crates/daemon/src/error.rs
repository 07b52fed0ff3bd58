use builder_core::validation::ValidationError;
use thiserror::Error;

use crate::usage::UsageError;

/// Service-level failures; mapped to HTTP statuses in `http`.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("missing caller identity")]
    Unauthorized,
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Usage(#[from] UsageError),
    #[error("unsupported event: {0}")]
    UnsupportedEvent(String),
    #[error("invalid event payload: {0}")]
    InvalidEvent(String),
    #[error("database error: {0}")]
    Db(#[from] surrealdb::Error),
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}
