//! Request and response bodies of the daemon HTTP API.

use serde::{Deserialize, Serialize};

use crate::model::{CodeAgentRun, JobLease, JobOutcome, JobResult, JobStatus, Message, NewMessage};

/// Header carrying the lease token on agent reads that have no body.
pub const LEASE_TOKEN_HEADER: &str = "x-lease-token";

/// Create a project from an initial prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProjectRequest {
    /// First prompt.
    pub value: String,
}

/// Follow-up prompt for an existing project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageRequest {
    /// Prompt text.
    pub value: String,
    /// Target project; must belong to the caller.
    pub project_id: String,
}

/// Raw event submitted to the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendEventRequest {
    /// Event name; only `code-agent/run` is accepted.
    pub name: String,
    /// Event payload.
    pub data: serde_json::Value,
}

/// Event bus acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendEventResponse {
    /// Job created for the event.
    pub job_id: String,
}

/// Public view of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    /// Job id.
    pub job_id: String,
    /// Current status.
    pub status: JobStatus,
    /// Attempts started so far.
    pub attempt: u32,
    /// Event that queued the job.
    pub event: CodeAgentRun,
    /// Set once the job succeeded.
    pub result: Option<JobResult>,
    /// Last failure, if any.
    pub error: Option<String>,
}

/// Credit usage for the calling user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageStatus {
    /// Credits left in the current window.
    pub remaining_points: u32,
    /// Credits used in the current window.
    pub consumed_points: u32,
    /// Milliseconds until the current window resets.
    pub ms_before_next: i64,
}

/// Agent claim request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRequest {
    /// Stable id of the polling agent.
    pub agent_id: String,
}

/// Agent claim response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimResponse {
    /// `None` when nothing is claimable.
    pub lease: Option<JobLease>,
}

/// Agent lease renewal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Lease owner.
    pub agent_id: String,
    /// Leased job.
    pub job_id: String,
    /// Token from the claim.
    pub lease_token: String,
}

/// Lease renewal response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// `false` once the lease is lost.
    pub ok: bool,
    /// New expiry (ms) when renewed.
    pub lease_expires_at_ms: Option<i64>,
}

/// Agent complete request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    /// Lease owner.
    pub agent_id: String,
    /// Leased job.
    pub job_id: String,
    /// Token from the claim.
    pub lease_token: String,
    /// What happened.
    pub outcome: JobOutcome,
}

/// Agent complete response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteResponse {
    /// Whether the outcome was accepted.
    pub ok: bool,
    /// Reason when rejected, or a note.
    pub message: Option<String>,
}

/// Conversation history lookup for a running job. Only the job's own
/// project can be read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindMessagesRequest {
    /// Leased job.
    pub job_id: String,
    /// Token from the claim.
    pub lease_token: String,
    /// The job's project.
    pub project_id: String,
    /// Maximum messages returned.
    pub limit: usize,
}

/// Messages ordered most recent first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindMessagesResponse {
    /// Newest first.
    pub messages: Vec<Message>,
}

/// Reply persisted on behalf of a running job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistMessageRequest {
    /// Leased job.
    pub job_id: String,
    /// Token from the claim.
    pub lease_token: String,
    /// The job's assistant reply.
    pub message: NewMessage,
}

/// Recorded step output, if the step already ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetStepResponse {
    /// `None` when the step has not run.
    pub output: Option<serde_json::Value>,
}

/// Record a step output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutStepRequest {
    /// Token from the claim.
    pub lease_token: String,
    /// Step output, stored as given.
    pub output: serde_json::Value,
}

/// Error body returned by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable message.
    pub error: String,
}
