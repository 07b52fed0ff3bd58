use std::convert::Infallible;

use thiserror::Error;

use crate::llm::ModelError;
use crate::sandbox::SandboxError;
use crate::store::StoreError;

/// Failures that abort a job execution and hand it back to the queue.
///
/// Tool-level failures never show up here; they are reported to the model.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("recorded output of step {key} is unreadable: {source}")]
    StepDecode {
        key: String,
        source: serde_json::Error,
    },
}

impl JobError {
    /// Whether another attempt of the job could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::Sandbox(SandboxError::Provision { .. } | SandboxError::Io(_)) => true,
            // A replayed attempt resumes the same session id.
            JobError::Sandbox(_) => false,
            JobError::Model(e) => e.is_retryable(),
            JobError::Store(StoreError::Unavailable(_)) => true,
            JobError::Store(_) | JobError::StepDecode { .. } => false,
        }
    }
}

impl From<Infallible> for JobError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}
