use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A message in the model context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: Option<String>,
        #[serde(default)]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

/// A function call requested by the model. `arguments` is raw JSON text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Tool advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: serde_json::Value,
}

/// One inference result.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelReply {
    pub text: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl ModelReply {
    /// Reply text, treating blank text as absent.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }

    /// Assistant message to append to the context.
    pub fn to_message(&self) -> ChatMessage {
        ChatMessage::Assistant {
            content: self.text.clone(),
            tool_calls: self.tool_calls.clone(),
        }
    }
}

/// Model call failure.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model request failed: {message}")]
    Request { message: String, retryable: bool },
    #[error("model returned HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        retryable: bool,
    },
    #[error("model response could not be decoded: {0}")]
    Decode(String),
    #[error("model returned no choices")]
    EmptyResponse,
}

impl ModelError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::Request { retryable, .. } | ModelError::Http { retryable, .. } => {
                *retryable
            }
            ModelError::Decode(_) | ModelError::EmptyResponse => false,
        }
    }
}

/// A chat model with tool calling.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ModelReply, ModelError>;
}
