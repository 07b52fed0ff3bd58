use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Template the sandbox is created from.
pub const DEFAULT_TEMPLATE: &str = "viber-nextjs-test";

/// Port the generated app is served on inside the sandbox.
pub const SERVING_PORT: u16 = 3000;

/// Session lifetime applied on creation and on every reconnect.
pub const DEFAULT_SANDBOX_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Sandbox failures. Command failures are not errors; see [`CommandOutput`].
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to provision sandbox from template {template}: {reason}")]
    Provision { template: String, reason: String },
    #[error("sandbox session {0} expired or does not exist")]
    SessionExpired(String),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("invalid sandbox path {path}: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("sandbox io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Output captured from one shell command.
///
/// `error` is set when the command could not run to a zero exit; the buffers
/// still hold whatever was produced before the failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl CommandOutput {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Remote execution environment provider.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Create a session from a named template and return its id.
    async fn acquire(&self, template: &str) -> Result<String, SandboxError>;

    /// Reconnect to a live session.
    async fn resume(&self, session_id: &str) -> Result<(), SandboxError>;

    /// Extend the session lifetime to `timeout` from now.
    async fn set_timeout(&self, session_id: &str, timeout: Duration) -> Result<(), SandboxError>;

    /// Run a shell command to completion.
    async fn run(&self, session_id: &str, command: &str) -> Result<CommandOutput, SandboxError>;

    async fn write_file(
        &self,
        session_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError>;

    async fn read_file(&self, session_id: &str, path: &str) -> Result<String, SandboxError>;

    /// Externally reachable host for a port. No health check is done.
    fn host_for(&self, session_id: &str, port: u16) -> String;
}

/// A connected session: resumed and with its lifetime extended.
#[derive(Clone)]
pub struct SandboxHandle {
    provider: Arc<dyn Sandbox>,
    session_id: String,
}

impl std::fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl SandboxHandle {
    /// Resume `session_id` and push its expiry `timeout` into the future.
    pub async fn connect(
        provider: Arc<dyn Sandbox>,
        session_id: &str,
        timeout: Duration,
    ) -> Result<Self, SandboxError> {
        provider.resume(session_id).await?;
        provider.set_timeout(session_id, timeout).await?;
        Ok(Self {
            provider,
            session_id: session_id.to_string(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn run(&self, command: &str) -> Result<CommandOutput, SandboxError> {
        self.provider.run(&self.session_id, command).await
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        self.provider.write_file(&self.session_id, path, content).await
    }

    pub async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        self.provider.read_file(&self.session_id, path).await
    }

    /// Public URL of the app listening on `port`.
    pub fn url_for(&self, port: u16) -> String {
        format!("https://{}", self.provider.host_for(&self.session_id, port))
    }
}
