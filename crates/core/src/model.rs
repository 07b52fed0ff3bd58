//! Persisted records and job lifecycle types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Name of the event that triggers a code-agent run.
pub const CODE_AGENT_RUN_EVENT: &str = "code-agent/run";

/// Fixed assistant reply persisted when a run produces no usable result.
pub const ERROR_REPLY: &str = "Something went wrong. Please try again.";

/// Generated files keyed by path relative to the sandbox working directory.
pub type FileMap = BTreeMap<String, String>;

/// Author of a persisted message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// Prompt typed by the project owner.
    User,
    /// Reply written by a code-agent job.
    Assistant,
}

/// Kind of a persisted message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Regular conversation content (user prompt or successful result).
    Result,
    /// Fixed-text failure reply.
    Error,
}

/// A project groups one conversation with the builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// ULID.
    pub project_id: String,
    /// Two-word kebab-case slug.
    pub name: String,
    /// Owner.
    pub user_id: String,
    /// Creation time (ms).
    pub created_at_ms: i64,
    /// Bumped whenever a message is added.
    pub updated_at_ms: i64,
}

/// Artifact snapshot attached to a successful assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fragment {
    /// ULID.
    pub fragment_id: String,
    /// Owning message; at most one fragment per message.
    pub message_id: String,
    /// Public preview URL of the sandbox that built the files.
    pub sandbox_url: String,
    /// Short display title.
    pub title: String,
    /// Files written during the run.
    pub files: FileMap,
    /// Creation time (ms).
    pub created_at_ms: i64,
}

/// Fragment content supplied when creating a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewFragment {
    /// Public preview URL.
    pub sandbox_url: String,
    /// Short display title.
    pub title: String,
    /// Files written during the run.
    pub files: FileMap,
}

/// Persisted conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// ULID, or `<job_id>-reply` for a job's assistant reply.
    pub message_id: String,
    /// Owning project.
    pub project_id: String,
    /// Text shown in the conversation.
    pub content: String,
    /// Author.
    pub role: Role,
    /// Serialized as `type`.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Present only on successful assistant replies.
    #[serde(default)]
    pub fragment: Option<Fragment>,
    /// Creation time (ms).
    pub created_at_ms: i64,
    /// Last update time (ms).
    pub updated_at_ms: i64,
}

/// Message content supplied to the store; ids and timestamps are assigned on write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMessage {
    /// Owning project.
    pub project_id: String,
    /// Text shown in the conversation.
    pub content: String,
    /// Author.
    pub role: Role,
    /// Serialized as `type`.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Written in the same transaction as the message.
    #[serde(default)]
    pub fragment: Option<NewFragment>,
}

/// Speaker of a conversation turn handed to the agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    /// Prompt from the user.
    User,
    /// Earlier assistant reply.
    Assistant,
}

impl From<Role> for TurnRole {
    fn from(role: Role) -> Self {
        match role {
            Role::Assistant => TurnRole::Assistant,
            Role::User => TurnRole::User,
        }
    }
}

/// One prior conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Turn {
    /// Speaker.
    pub role: TurnRole,
    /// Message text.
    pub content: String,
}

impl From<&Message> for Turn {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role.into(),
            content: message.content.clone(),
        }
    }
}

/// Payload of the `code-agent/run` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CodeAgentRun {
    /// The user's prompt.
    pub value: String,
    /// Project the run belongs to.
    pub project_id: String,
}

/// Value returned by a finished code-agent job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobResult {
    /// Preview URL; empty when the run failed.
    pub url: String,
    /// Fragment title; empty when the run failed.
    pub title: String,
    /// Files written during the run.
    pub files: FileMap,
    /// Full completion text, or empty.
    pub summary: String,
}

/// Runtime status for a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed.
    Queued,
    /// Leased to an agent.
    Running,
    /// Finished with a result.
    Succeeded,
    /// Out of attempts, or failed permanently.
    Failed,
}

impl JobStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    /// Whether the job can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Job lease returned to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLease {
    /// Leased job.
    pub job_id: String,
    /// Fences writes to this attempt.
    pub lease_token: String,
    /// 1-based attempt number of this execution.
    pub attempt: u32,
    /// Event that queued the job.
    pub event: CodeAgentRun,

    /// Lease expiry timestamp (ms).
    pub lease_expires_at_ms: i64,
}

/// Final outcome an agent reports for a leased job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    /// The job ran to completion.
    Succeeded {
        /// What the run produced.
        result: JobResult,
    },
    /// The attempt failed.
    Failed {
        /// Failure description.
        error: String,
        /// Another attempt cannot succeed; skip the remaining retries.
        #[serde(default)]
        permanent: bool,
    },
}

impl JobOutcome {
    /// Status the job takes once this outcome is recorded.
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Succeeded { .. } => JobStatus::Succeeded,
            JobOutcome::Failed { .. } => JobStatus::Failed,
        }
    }
}
