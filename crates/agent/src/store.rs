use async_trait::async_trait;
use builder_core::model::{Message, NewMessage};
use thiserror::Error;

/// Failure talking to durable storage.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store rejected request: {0}")]
    Rejected(String),
    #[error("store payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Message persistence consumed by the orchestration core.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Most recent `limit` messages of a project, newest first.
    async fn find_messages(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Persist a message, and its fragment when present, in one write.
    async fn create_message(&self, message: NewMessage) -> Result<Message, StoreError>;
}
