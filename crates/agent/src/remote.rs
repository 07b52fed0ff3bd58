//! HTTP client for the daemon's agent protocol.

use async_trait::async_trait;
use builder_core::api::{
    ClaimRequest, ClaimResponse, CompleteRequest, CompleteResponse, ErrorBody,
    FindMessagesRequest, FindMessagesResponse, GetStepResponse, HeartbeatRequest,
    HeartbeatResponse, PersistMessageRequest, PutStepRequest, LEASE_TOKEN_HEADER,
};
use builder_core::model::{JobLease, JobOutcome, Message, NewMessage};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;

use crate::steps::StepStore;
use crate::store::{MessageStore, StoreError};

/// Daemon base client, shared by the worker loop and job channels.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    http: Client,
    base_url: String,
}

impl DaemonClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub async fn claim(&self, agent_id: &str) -> Result<Option<JobLease>, StoreError> {
        let ClaimResponse { lease } = send(self.http.post(self.url("/v1/agent/claim")).json(
            &ClaimRequest {
                agent_id: agent_id.to_string(),
            },
        ))
        .await?;
        Ok(lease)
    }

    pub async fn heartbeat(
        &self,
        agent_id: &str,
        lease: &JobLease,
    ) -> Result<HeartbeatResponse, StoreError> {
        send(
            self.http
                .post(self.url("/v1/agent/heartbeat"))
                .json(&HeartbeatRequest {
                    agent_id: agent_id.to_string(),
                    job_id: lease.job_id.clone(),
                    lease_token: lease.lease_token.clone(),
                }),
        )
        .await
    }

    pub async fn complete(
        &self,
        agent_id: &str,
        lease: &JobLease,
        outcome: JobOutcome,
    ) -> Result<CompleteResponse, StoreError> {
        send(
            self.http
                .post(self.url("/v1/agent/complete"))
                .json(&CompleteRequest {
                    agent_id: agent_id.to_string(),
                    job_id: lease.job_id.clone(),
                    lease_token: lease.lease_token.clone(),
                    outcome,
                }),
        )
        .await
    }

    /// Message and step storage scoped to one leased job.
    pub fn job_channel(&self, lease: &JobLease) -> JobChannel {
        JobChannel {
            client: self.clone(),
            job_id: lease.job_id.clone(),
            lease_token: lease.lease_token.clone(),
        }
    }
}

/// Storage for a running job. Writes carry the lease token and are rejected
/// once the lease has moved to another agent.
#[derive(Debug, Clone)]
pub struct JobChannel {
    client: DaemonClient,
    job_id: String,
    lease_token: String,
}

impl JobChannel {
    fn step_url(&self, job_id: &str, key: &str) -> String {
        self.client
            .url(&format!("/v1/agent/jobs/{job_id}/steps/{key}"))
    }
}

#[async_trait]
impl MessageStore for JobChannel {
    async fn find_messages(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let FindMessagesResponse { messages } = send(
            self.client
                .http
                .post(self.client.url("/v1/agent/messages/find"))
                .json(&FindMessagesRequest {
                    job_id: self.job_id.clone(),
                    lease_token: self.lease_token.clone(),
                    project_id: project_id.to_string(),
                    limit,
                }),
        )
        .await?;
        Ok(messages)
    }

    async fn create_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        send(
            self.client
                .http
                .post(self.client.url("/v1/agent/messages"))
                .json(&PersistMessageRequest {
                    job_id: self.job_id.clone(),
                    lease_token: self.lease_token.clone(),
                    message,
                }),
        )
        .await
    }
}

#[async_trait]
impl StepStore for JobChannel {
    async fn load_step(
        &self,
        job_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let GetStepResponse { output } = send(
            self.client
                .http
                .get(self.step_url(job_id, key))
                .header(LEASE_TOKEN_HEADER, &self.lease_token),
        )
        .await?;
        Ok(output)
    }

    async fn save_step(
        &self,
        job_id: &str,
        key: &str,
        output: serde_json::Value,
    ) -> Result<(), StoreError> {
        let _: serde_json::Value = send(
            self.client
                .http
                .put(self.step_url(job_id, key))
                .json(&PutStepRequest {
                    lease_token: self.lease_token.clone(),
                    output,
                }),
        )
        .await?;
        Ok(())
    }
}

async fn send<T: DeserializeOwned>(req: RequestBuilder) -> Result<T, StoreError> {
    let resp = req
        .send()
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or(body);
        let message = format!("{status}: {detail}");
        return Err(if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            StoreError::Unavailable(message)
        } else {
            StoreError::Rejected(message)
        });
    }

    resp.json::<T>()
        .await
        .map_err(|e| StoreError::Unavailable(format!("invalid daemon response: {e}")))
}
