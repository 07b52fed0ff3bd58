use std::collections::HashMap;

use builder_core::{
    api::{
        CompleteRequest, CompleteResponse, CreateMessageRequest, CreateProjectRequest,
        FindMessagesRequest, HeartbeatRequest, HeartbeatResponse, JobView, PersistMessageRequest,
        SendEventRequest, UsageStatus,
    },
    model::{
        CodeAgentRun, Fragment, JobLease, JobOutcome, JobResult, JobStatus, Message, MessageType,
        NewMessage, Project, Role, CODE_AGENT_RUN_EVENT, ERROR_REPLY,
    },
    new_ulid, now_ms,
    validation::{validate_create_message, validate_create_project, validate_event},
};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::Db;
use crate::error::ServiceError;
use crate::slug;
use crate::usage::{self, Plan, UsageRecord, GENERATION_COST};

/// Messages returned to the UI per project.
pub const UI_MESSAGE_LIMIT: usize = 20;

type Result<T> = std::result::Result<T, ServiceError>;

/// Authenticated caller, as asserted by the upstream auth layer.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
    pub plan: Plan,
}

/// Delay before a failed attempt becomes claimable again.
pub fn retry_delay_ms(failed_attempt: u32) -> i64 {
    match failed_attempt {
        0 | 1 => 0,
        2 => 5_000,
        _ => 30_000,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessageRow {
    message_id: String,
    project_id: String,
    content: String,
    role: Role,
    #[serde(rename = "type")]
    message_type: MessageType,
    created_at_ms: i64,
    updated_at_ms: i64,
}

impl MessageRow {
    fn into_message(self, fragment: Option<Fragment>) -> Message {
        Message {
            message_id: self.message_id,
            project_id: self.project_id,
            content: self.content,
            role: self.role,
            message_type: self.message_type,
            fragment,
            created_at_ms: self.created_at_ms,
            updated_at_ms: self.updated_at_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobRow {
    job_id: String,
    event: CodeAgentRun,
    status: JobStatus,
    attempt: u32,
    max_attempts: u32,
    visible_at_ms: i64,
    created_at_ms: i64,
    #[serde(default)]
    lease_owner: Option<String>,
    #[serde(default)]
    lease_token: Option<String>,
    #[serde(default)]
    lease_expires_at_ms: Option<i64>,
    #[serde(default)]
    started_at_ms: Option<i64>,
    #[serde(default)]
    finished_at_ms: Option<i64>,
    #[serde(default)]
    result: Option<JobResult>,
    #[serde(default)]
    error: Option<String>,
}

impl JobRow {
    fn holds_lease(&self, agent_id: Option<&str>, lease_token: &str, now: i64) -> bool {
        self.status == JobStatus::Running
            && self.lease_token.as_deref() == Some(lease_token)
            && agent_id.map_or(true, |a| self.lease_owner.as_deref() == Some(a))
            && self.lease_expires_at_ms.is_some_and(|t| t >= now)
    }

    fn view(self) -> JobView {
        JobView {
            job_id: self.job_id,
            status: self.status,
            attempt: self.attempt,
            event: self.event,
            result: self.result,
            error: self.error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StepRow {
    job_id: String,
    key: String,
    output: serde_json::Value,
    created_at_ms: i64,
}

/// Projects, messages, credits, the job queue and the step log.
pub struct BuilderService {
    db: Db,
    lease_ms: i64,
    max_attempts: u32,
    queue_lock: Mutex<()>,
    usage_lock: Mutex<()>,
}

impl BuilderService {
    pub fn new(db: Db, lease_ms: i64, max_attempts: u32) -> Self {
        Self {
            db,
            lease_ms,
            max_attempts: max_attempts.max(1),
            queue_lock: Mutex::new(()),
            usage_lock: Mutex::new(()),
        }
    }

    // ---- projects and messages ----

    /// Create a project from its first prompt and start a generation.
    pub async fn create_project(
        &self,
        caller: &Caller,
        req: CreateProjectRequest,
    ) -> Result<Project> {
        validate_create_project(&req)?;
        self.consume_credits(caller).await?;

        let now = now_ms();
        let project = Project {
            project_id: new_ulid().to_string(),
            name: slug::generate(),
            user_id: caller.user_id.clone(),
            created_at_ms: now,
            updated_at_ms: now,
        };
        self.db
            .inner()
            .query("CREATE $project CONTENT $row RETURN NONE;")
            .bind(("project", thing("project", &project.project_id)))
            .bind(("row", project.clone()))
            .await?
            .check()?;

        self.create_message_tx(user_prompt(&project.project_id, &req.value))
            .await?;
        self.send_event(CodeAgentRun {
            value: req.value,
            project_id: project.project_id.clone(),
        })
        .await?;

        tracing::info!(project_id = %project.project_id, name = %project.name, "project created");
        Ok(project)
    }

    /// Follow-up prompt on an existing project.
    pub async fn create_message(
        &self,
        caller: &Caller,
        req: CreateMessageRequest,
    ) -> Result<Message> {
        validate_create_message(&req)?;
        let project = self.get_project(caller, &req.project_id).await?;
        self.consume_credits(caller).await?;

        let message = self
            .create_message_tx(user_prompt(&project.project_id, &req.value))
            .await?;
        self.send_event(CodeAgentRun {
            value: req.value,
            project_id: project.project_id,
        })
        .await?;
        Ok(message)
    }

    pub async fn get_project(&self, caller: &Caller, project_id: &str) -> Result<Project> {
        let mut resp = self
            .db
            .inner()
            .query("SELECT * OMIT id FROM $project;")
            .bind(("project", thing("project", project_id)))
            .await?;
        let project: Option<Project> = resp.take(0)?;
        project
            .filter(|p| p.user_id == caller.user_id)
            .ok_or_else(|| ServiceError::NotFound(format!("project {project_id}")))
    }

    /// The caller's projects, most recently updated first.
    pub async fn list_projects(&self, caller: &Caller) -> Result<Vec<Project>> {
        let mut resp = self
            .db
            .inner()
            .query(
                "SELECT * OMIT id FROM project WHERE user_id = $user_id ORDER BY updated_at_ms DESC;",
            )
            .bind(("user_id", caller.user_id.clone()))
            .await?;
        Ok(resp.take(0)?)
    }

    /// Up to [`UI_MESSAGE_LIMIT`] messages, oldest first, with fragments.
    pub async fn list_messages(&self, caller: &Caller, project_id: &str) -> Result<Vec<Message>> {
        self.get_project(caller, project_id).await?;
        let mut resp = self
            .db
            .inner()
            .query(
                "SELECT * OMIT id FROM message WHERE project_id = $project_id \
                 ORDER BY updated_at_ms ASC LIMIT $limit;",
            )
            .bind(("project_id", project_id.to_string()))
            .bind(("limit", UI_MESSAGE_LIMIT))
            .await?;
        let rows: Vec<MessageRow> = resp.take(0)?;
        self.attach_fragments(rows).await
    }

    /// Most recent `limit` messages, newest first.
    pub async fn find_messages(&self, project_id: &str, limit: usize) -> Result<Vec<Message>> {
        let mut resp = self
            .db
            .inner()
            .query(
                "SELECT * OMIT id FROM message WHERE project_id = $project_id \
                 ORDER BY created_at_ms DESC LIMIT $limit;",
            )
            .bind(("project_id", project_id.to_string()))
            .bind(("limit", limit))
            .await?;
        let rows: Vec<MessageRow> = resp.take(0)?;
        self.attach_fragments(rows).await
    }

    /// History lookup for a running job, limited to the job's own project.
    pub async fn find_job_messages(&self, req: FindMessagesRequest) -> Result<Vec<Message>> {
        let job = self.leased_job(&req.job_id, &req.lease_token).await?;
        ensure_same_project(&job, &req.project_id)?;
        self.find_messages(&req.project_id, req.limit).await
    }

    /// Reply written by a running job, fenced by its lease.
    pub async fn persist_message(&self, req: PersistMessageRequest) -> Result<Message> {
        let job = self.leased_job(&req.job_id, &req.lease_token).await?;
        ensure_same_project(&job, &req.message.project_id)?;
        self.create_reply(&job.job_id, req.message).await
    }

    /// The single assistant reply of a job. Its id derives from the job, so
    /// a retried write returns the stored reply instead of adding another.
    async fn create_reply(&self, job_id: &str, new: NewMessage) -> Result<Message> {
        let message_id = reply_message_id(job_id);
        if let Some(existing) = self.load_message(&message_id).await? {
            tracing::debug!(%job_id, %message_id, "reply already stored");
            return Ok(existing);
        }
        match self.insert_message(message_id.clone(), new).await {
            Ok(message) => Ok(message),
            Err(err) => match self.load_message(&message_id).await? {
                Some(existing) => Ok(existing),
                None => Err(err),
            },
        }
    }

    async fn load_message(&self, message_id: &str) -> Result<Option<Message>> {
        let mut resp = self
            .db
            .inner()
            .query("SELECT * OMIT id FROM $message;")
            .bind(("message", thing("message", message_id)))
            .await?;
        let row: Option<MessageRow> = resp.take(0)?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(self.attach_fragments(vec![row]).await?.pop())
    }

    async fn attach_fragments(&self, rows: Vec<MessageRow>) -> Result<Vec<Message>> {
        if rows.is_empty() {
            return Ok(vec![]);
        }
        let ids: Vec<String> = rows.iter().map(|r| r.message_id.clone()).collect();
        let mut resp = self
            .db
            .inner()
            .query("SELECT * OMIT id FROM fragment WHERE message_id IN $ids;")
            .bind(("ids", ids))
            .await?;
        let fragments: Vec<Fragment> = resp.take(0)?;
        let mut by_message: HashMap<String, Fragment> = fragments
            .into_iter()
            .map(|f| (f.message_id.clone(), f))
            .collect();

        Ok(rows
            .into_iter()
            .map(|row| {
                let fragment = by_message.remove(&row.message_id);
                row.into_message(fragment)
            })
            .collect())
    }

    async fn create_message_tx(&self, new: NewMessage) -> Result<Message> {
        self.insert_message(new_ulid().to_string(), new).await
    }

    /// Write a message and its fragment together, and touch the project.
    /// Fails if `message_id` is taken.
    async fn insert_message(&self, message_id: String, new: NewMessage) -> Result<Message> {
        let now = now_ms();
        let row = MessageRow {
            message_id: message_id.clone(),
            project_id: new.project_id.clone(),
            content: new.content,
            role: new.role,
            message_type: new.message_type,
            created_at_ms: now,
            updated_at_ms: now,
        };
        let fragment = new.fragment.map(|f| Fragment {
            fragment_id: new_ulid().to_string(),
            message_id: message_id.clone(),
            sandbox_url: f.sandbox_url,
            title: f.title,
            files: f.files,
            created_at_ms: now,
        });

        let mut sql = String::from(
            "BEGIN TRANSACTION;\nCREATE $message CONTENT $message_row RETURN NONE;\n",
        );
        if fragment.is_some() {
            sql.push_str("CREATE $fragment CONTENT $fragment_row RETURN NONE;\n");
        }
        sql.push_str("UPDATE $project SET updated_at_ms = $now RETURN NONE;\nCOMMIT TRANSACTION;");

        let mut query = self
            .db
            .inner()
            .query(sql)
            .bind(("message", thing("message", &message_id)))
            .bind(("message_row", row.clone()))
            .bind(("project", thing("project", &row.project_id)))
            .bind(("now", now));
        if let Some(f) = &fragment {
            query = query
                .bind(("fragment", thing("fragment", &f.fragment_id)))
                .bind(("fragment_row", f.clone()));
        }
        query.await?.check()?;

        tracing::debug!(
            message_id = %message_id,
            project_id = %row.project_id,
            with_fragment = fragment.is_some(),
            "message stored"
        );
        Ok(row.into_message(fragment))
    }

    // ---- credits ----

    async fn consume_credits(&self, caller: &Caller) -> Result<()> {
        let _guard = self.usage_lock.lock().await;
        let record = self.load_usage(&caller.user_id).await?;
        let next = usage::consume(
            record,
            &caller.user_id,
            caller.plan,
            GENERATION_COST,
            now_ms(),
        )?;
        self.db
            .inner()
            .query("UPSERT $usage CONTENT $row RETURN NONE;")
            .bind(("usage", thing("usage", &caller.user_id)))
            .bind(("row", next))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn usage_status(&self, caller: &Caller) -> Result<UsageStatus> {
        let record = self.load_usage(&caller.user_id).await?;
        Ok(usage::status(record.as_ref(), caller.plan, now_ms()))
    }

    async fn load_usage(&self, user_id: &str) -> Result<Option<UsageRecord>> {
        let mut resp = self
            .db
            .inner()
            .query("SELECT * OMIT id FROM $usage;")
            .bind(("usage", thing("usage", user_id)))
            .await?;
        Ok(resp.take(0)?)
    }

    // ---- event bus and job queue ----

    /// Accept a raw event from a caller. Only `code-agent/run` is
    /// recognised; it needs a project the caller owns and one credit.
    pub async fn send_raw_event(&self, caller: &Caller, req: SendEventRequest) -> Result<String> {
        if req.name != CODE_AGENT_RUN_EVENT {
            return Err(ServiceError::UnsupportedEvent(req.name));
        }
        let event: CodeAgentRun = serde_json::from_value(req.data)
            .map_err(|e| ServiceError::InvalidEvent(e.to_string()))?;
        validate_event(&event)?;
        self.get_project(caller, &event.project_id).await?;
        self.consume_credits(caller).await?;
        self.send_event(event).await
    }

    /// Queue a `code-agent/run` job. Every event is its own job. Callers
    /// have already checked ownership and consumed a credit.
    async fn send_event(&self, event: CodeAgentRun) -> Result<String> {
        validate_event(&event)?;
        let now = now_ms();
        let job = JobRow {
            job_id: new_ulid().to_string(),
            event,
            status: JobStatus::Queued,
            attempt: 0,
            max_attempts: self.max_attempts,
            visible_at_ms: now,
            created_at_ms: now,
            lease_owner: None,
            lease_token: None,
            lease_expires_at_ms: None,
            started_at_ms: None,
            finished_at_ms: None,
            result: None,
            error: None,
        };
        self.db
            .inner()
            .query("CREATE $job CONTENT $row RETURN NONE;")
            .bind(("job", thing("job", &job.job_id)))
            .bind(("row", job.clone()))
            .await?
            .check()?;

        tracing::info!(
            job_id = %job.job_id,
            project_id = %job.event.project_id,
            event = CODE_AGENT_RUN_EVENT,
            "event queued"
        );
        Ok(job.job_id)
    }

    /// A job on one of the caller's projects.
    pub async fn get_job(&self, caller: &Caller, job_id: &str) -> Result<JobView> {
        let not_found = || ServiceError::NotFound(format!("job {job_id}"));
        let job = self.load_job(job_id).await?.ok_or_else(not_found)?;
        match self.get_project(caller, &job.event.project_id).await {
            Ok(_) => Ok(job.view()),
            Err(ServiceError::NotFound(_)) => Err(not_found()),
            Err(e) => Err(e),
        }
    }

    /// Lease the oldest claimable job.
    pub async fn claim_job(&self, agent_id: String) -> Result<Option<JobLease>> {
        let _guard = self.queue_lock.lock().await;
        let now = now_ms();

        let mut resp = self
            .db
            .inner()
            .query(
                "SELECT * OMIT id FROM job WHERE status = 'queued' AND visible_at_ms <= $now \
                 ORDER BY created_at_ms ASC LIMIT 1;",
            )
            .bind(("now", now))
            .await?;
        let jobs: Vec<JobRow> = resp.take(0)?;
        let Some(job) = jobs.into_iter().next() else {
            return Ok(None);
        };

        let lease_token = Uuid::new_v4().to_string();
        let attempt = job.attempt + 1;
        let lease_expires_at_ms = now + self.lease_ms;

        self.db
            .inner()
            .query(
                r#"
                UPDATE $job
                SET status = 'running',
                    attempt = $attempt,
                    lease_owner = $agent_id,
                    lease_token = $lease_token,
                    lease_expires_at_ms = $lease_expires_at_ms,
                    started_at_ms = $now
                RETURN NONE;
                "#,
            )
            .bind(("job", thing("job", &job.job_id)))
            .bind(("attempt", attempt))
            .bind(("agent_id", agent_id.clone()))
            .bind(("lease_token", lease_token.clone()))
            .bind(("lease_expires_at_ms", lease_expires_at_ms))
            .bind(("now", now))
            .await?
            .check()?;

        tracing::info!(job_id = %job.job_id, %agent_id, attempt, "job leased");
        Ok(Some(JobLease {
            job_id: job.job_id,
            lease_token,
            attempt,
            event: job.event,
            lease_expires_at_ms,
        }))
    }

    /// Extend a live lease.
    pub async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse> {
        let now = now_ms();
        let Some(job) = self.load_job(&req.job_id).await? else {
            return Ok(HeartbeatResponse {
                ok: false,
                lease_expires_at_ms: None,
            });
        };
        if !job.holds_lease(Some(&req.agent_id), &req.lease_token, now) {
            return Ok(HeartbeatResponse {
                ok: false,
                lease_expires_at_ms: None,
            });
        }

        let expires = now + self.lease_ms;
        self.db
            .inner()
            .query("UPDATE $job SET lease_expires_at_ms = $expires RETURN NONE;")
            .bind(("job", thing("job", &job.job_id)))
            .bind(("expires", expires))
            .await?
            .check()?;
        Ok(HeartbeatResponse {
            ok: true,
            lease_expires_at_ms: Some(expires),
        })
    }

    /// Record an agent's outcome for its leased job.
    pub async fn complete_job(&self, req: CompleteRequest) -> Result<CompleteResponse> {
        let _guard = self.queue_lock.lock().await;

        let Some(job) = self.load_job(&req.job_id).await? else {
            return Ok(CompleteResponse {
                ok: false,
                message: Some("job not found".into()),
            });
        };

        // Idempotency: if already finished, accept.
        if job.status.is_terminal() {
            return Ok(CompleteResponse {
                ok: true,
                message: Some("already completed".into()),
            });
        }

        let owner_ok = job.lease_owner.as_deref() == Some(req.agent_id.as_str());
        let token_ok = job.lease_token.as_deref() == Some(req.lease_token.as_str());
        if job.status != JobStatus::Running || !owner_ok || !token_ok {
            return Ok(CompleteResponse {
                ok: false,
                message: Some("lease mismatch".into()),
            });
        }

        match req.outcome {
            JobOutcome::Succeeded { result } => {
                self.db
                    .inner()
                    .query(
                        r#"
                        UPDATE $job
                        SET status = 'succeeded',
                            result = $result,
                            finished_at_ms = $now,
                            lease_owner = NONE,
                            lease_token = NONE,
                            lease_expires_at_ms = NONE
                        RETURN NONE;
                        "#,
                    )
                    .bind(("job", thing("job", &job.job_id)))
                    .bind(("result", result))
                    .bind(("now", now_ms()))
                    .await?
                    .check()?;
                tracing::info!(job_id = %job.job_id, "job succeeded");
            }
            JobOutcome::Failed { error, permanent } => {
                self.fail_attempt(&job, &error, !permanent).await?;
            }
        }

        Ok(CompleteResponse {
            ok: true,
            message: None,
        })
    }

    /// Periodic reconcile: expired leases count as failed attempts.
    pub async fn reconcile(&self) -> Result<()> {
        let _guard = self.queue_lock.lock().await;
        let mut resp = self
            .db
            .inner()
            .query(
                "SELECT * OMIT id FROM job WHERE status = 'running' \
                 AND lease_expires_at_ms != NONE AND lease_expires_at_ms < $now;",
            )
            .bind(("now", now_ms()))
            .await?;
        let expired: Vec<JobRow> = resp.take(0)?;

        for job in expired {
            tracing::warn!(job_id = %job.job_id, owner = ?job.lease_owner, "lease expired");
            self.fail_attempt(&job, "lease expired", true).await?;
        }
        Ok(())
    }

    /// Requeue with backoff, or fail permanently once attempts are used up
    /// or the failure is not retryable.
    async fn fail_attempt(&self, job: &JobRow, error: &str, retryable: bool) -> Result<JobStatus> {
        let now = now_ms();
        if retryable && job.attempt < job.max_attempts {
            let visible_at_ms = now + retry_delay_ms(job.attempt);
            self.db
                .inner()
                .query(
                    r#"
                    UPDATE $job
                    SET status = 'queued',
                        visible_at_ms = $visible_at_ms,
                        error = $error,
                        lease_owner = NONE,
                        lease_token = NONE,
                        lease_expires_at_ms = NONE
                    RETURN NONE;
                    "#,
                )
                .bind(("job", thing("job", &job.job_id)))
                .bind(("visible_at_ms", visible_at_ms))
                .bind(("error", error.to_string()))
                .await?
                .check()?;
            tracing::warn!(
                job_id = %job.job_id,
                attempt = job.attempt,
                retry_in_ms = visible_at_ms - now,
                %error,
                "job attempt failed; requeued"
            );
            return Ok(JobStatus::Queued);
        }

        self.db
            .inner()
            .query(
                r#"
                UPDATE $job
                SET status = 'failed',
                    error = $error,
                    finished_at_ms = $now,
                    lease_owner = NONE,
                    lease_token = NONE,
                    lease_expires_at_ms = NONE
                RETURN NONE;
                "#,
            )
            .bind(("job", thing("job", &job.job_id)))
            .bind(("error", error.to_string()))
            .bind(("now", now))
            .await?
            .check()?;
        tracing::error!(job_id = %job.job_id, attempts = job.attempt, %error, "job failed");

        self.ensure_error_reply(job).await?;
        Ok(JobStatus::Failed)
    }

    /// A permanently failed job still leaves exactly one assistant reply:
    /// the one it saved, or the fixed error reply.
    async fn ensure_error_reply(&self, job: &JobRow) -> Result<()> {
        let reply = self
            .create_reply(
                &job.job_id,
                NewMessage {
                    project_id: job.event.project_id.clone(),
                    content: ERROR_REPLY.to_string(),
                    role: Role::Assistant,
                    message_type: MessageType::Error,
                    fragment: None,
                },
            )
            .await?;
        tracing::info!(job_id = %job.job_id, kind = ?reply.message_type, "final reply in place");
        Ok(())
    }

    async fn load_job(&self, job_id: &str) -> Result<Option<JobRow>> {
        let mut resp = self
            .db
            .inner()
            .query("SELECT * OMIT id FROM $job;")
            .bind(("job", thing("job", job_id)))
            .await?;
        Ok(resp.take(0)?)
    }

    async fn leased_job(&self, job_id: &str, lease_token: &str) -> Result<JobRow> {
        let job = self
            .load_job(job_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("job {job_id}")))?;
        if !job.holds_lease(None, lease_token, now_ms()) {
            return Err(ServiceError::Conflict("lease mismatch".into()));
        }
        Ok(job)
    }

    // ---- step log ----

    /// Recorded step output, for the lease holder.
    pub async fn get_step(
        &self,
        job_id: &str,
        key: &str,
        lease_token: &str,
    ) -> Result<Option<serde_json::Value>> {
        self.leased_job(job_id, lease_token).await?;
        let mut resp = self
            .db
            .inner()
            .query("SELECT * OMIT id FROM $step;")
            .bind(("step", thing("step", &step_id(job_id, key))))
            .await?;
        let step: Option<StepRow> = resp.take(0)?;
        Ok(step.map(|s| s.output))
    }

    /// Record a step output for the lease holder.
    pub async fn put_step(
        &self,
        job_id: &str,
        key: &str,
        lease_token: &str,
        output: serde_json::Value,
    ) -> Result<()> {
        self.leased_job(job_id, lease_token).await?;
        let row = StepRow {
            job_id: job_id.to_string(),
            key: key.to_string(),
            output,
            created_at_ms: now_ms(),
        };
        self.db
            .inner()
            .query("UPSERT $step CONTENT $row RETURN NONE;")
            .bind(("step", thing("step", &step_id(job_id, key))))
            .bind(("row", row))
            .await?
            .check()?;
        tracing::debug!(%job_id, step = %key, "step recorded");
        Ok(())
    }
}

fn user_prompt(project_id: &str, value: &str) -> NewMessage {
    NewMessage {
        project_id: project_id.to_string(),
        content: value.to_string(),
        role: Role::User,
        message_type: MessageType::Result,
        fragment: None,
    }
}

fn ensure_same_project(job: &JobRow, project_id: &str) -> Result<()> {
    if job.event.project_id != project_id {
        return Err(ServiceError::Conflict(format!(
            "job {} does not belong to project {project_id}",
            job.job_id
        )));
    }
    Ok(())
}

fn reply_message_id(job_id: &str) -> String {
    format!("{job_id}-reply")
}

fn step_id(job_id: &str, key: &str) -> String {
    format!("{job_id}/{key}")
}

fn thing(table: &str, id: &str) -> Thing {
    Thing::from((table, id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(status: JobStatus, token: Option<&str>, expires: Option<i64>) -> JobRow {
        JobRow {
            job_id: "j1".into(),
            event: CodeAgentRun {
                value: "build".into(),
                project_id: "p1".into(),
            },
            status,
            attempt: 1,
            max_attempts: 3,
            visible_at_ms: 0,
            created_at_ms: 0,
            lease_owner: Some("agent-1".into()),
            lease_token: token.map(String::from),
            lease_expires_at_ms: expires,
            started_at_ms: None,
            finished_at_ms: None,
            result: None,
            error: None,
        }
    }

    #[test]
    fn retry_backoff_schedule() {
        assert_eq!(retry_delay_ms(1), 0);
        assert_eq!(retry_delay_ms(2), 5_000);
        assert_eq!(retry_delay_ms(3), 30_000);
        assert_eq!(retry_delay_ms(9), 30_000);
    }

    #[test]
    fn lease_requires_running_status_token_and_time() {
        let live = job(JobStatus::Running, Some("t1"), Some(1_000));
        assert!(live.holds_lease(Some("agent-1"), "t1", 500));
        assert!(live.holds_lease(None, "t1", 1_000));
        assert!(!live.holds_lease(Some("agent-2"), "t1", 500));
        assert!(!live.holds_lease(None, "t2", 500));
        assert!(!live.holds_lease(None, "t1", 1_001));

        let queued = job(JobStatus::Queued, Some("t1"), Some(1_000));
        assert!(!queued.holds_lease(None, "t1", 500));
    }

    #[test]
    fn message_row_keeps_the_type_field_name() {
        let row = MessageRow {
            message_id: "m1".into(),
            project_id: "p1".into(),
            content: "hi".into(),
            role: Role::User,
            message_type: MessageType::Result,
            created_at_ms: 1,
            updated_at_ms: 1,
        };
        let value = serde_json::to_value(&row).unwrap();
        assert_eq!(value["type"], "RESULT");
        assert_eq!(value["role"], "USER");

        let message = row.into_message(None);
        assert_eq!(message.message_id, "m1");
        assert!(message.fragment.is_none());
    }

    #[test]
    fn step_ids_are_scoped_by_job() {
        assert_eq!(step_id("j1", "terminal:2"), "j1/terminal:2");
        assert_ne!(step_id("j1", "save-result"), step_id("j2", "save-result"));
    }

    mod stored {
        use std::time::Duration;

        use builder_core::model::{FileMap, NewFragment};
        use tempfile::TempDir;

        use super::*;

        const LEASE_MS: i64 = 60_000;

        async fn service(dir: &TempDir, lease_ms: i64, max_attempts: u32) -> BuilderService {
            let db = Db::connect(&dir.path().join("db")).await.unwrap();
            db.apply_schema().await.unwrap();
            BuilderService::new(db, lease_ms, max_attempts)
        }

        fn caller(user_id: &str, plan: Plan) -> Caller {
            Caller {
                user_id: user_id.into(),
                plan,
            }
        }

        async fn project_with_lease(svc: &BuilderService) -> (Caller, Project, JobLease) {
            let owner = caller("user_1", Plan::Pro);
            let project = svc
                .create_project(
                    &owner,
                    CreateProjectRequest {
                        value: "a todo app".into(),
                    },
                )
                .await
                .unwrap();
            let lease = svc.claim_job("agent-1".into()).await.unwrap().unwrap();
            (owner, project, lease)
        }

        fn result_reply(project_id: &str) -> NewMessage {
            NewMessage {
                project_id: project_id.into(),
                content: "Built a todo app.".into(),
                role: Role::Assistant,
                message_type: MessageType::Result,
                fragment: Some(NewFragment {
                    sandbox_url: "https://3000-s1.sandbox.test".into(),
                    title: "Todo App".into(),
                    files: FileMap::from([("app/page.tsx".into(), "export {}".into())]),
                }),
            }
        }

        fn failed(lease: &JobLease, permanent: bool) -> CompleteRequest {
            CompleteRequest {
                agent_id: "agent-1".into(),
                job_id: lease.job_id.clone(),
                lease_token: lease.lease_token.clone(),
                outcome: JobOutcome::Failed {
                    error: "model unavailable".into(),
                    permanent,
                },
            }
        }

        async fn assistant_replies(svc: &BuilderService, project_id: &str) -> Vec<Message> {
            svc.find_messages(project_id, 50)
                .await
                .unwrap()
                .into_iter()
                .filter(|m| m.role == Role::Assistant)
                .collect()
        }

        #[tokio::test]
        async fn new_project_queues_one_claimable_job() {
            let dir = TempDir::new().unwrap();
            let svc = service(&dir, LEASE_MS, 3).await;
            let (owner, project, lease) = project_with_lease(&svc).await;

            assert_eq!(lease.attempt, 1);
            assert_eq!(lease.event.project_id, project.project_id);
            assert_eq!(lease.event.value, "a todo app");
            assert!(svc.claim_job("agent-2".into()).await.unwrap().is_none());

            let messages = svc.list_messages(&owner, &project.project_id).await.unwrap();
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].role, Role::User);

            let view = svc.get_job(&owner, &lease.job_id).await.unwrap();
            assert_eq!(view.status, JobStatus::Running);
        }

        #[tokio::test]
        async fn exhausted_job_leaves_one_error_reply() {
            let dir = TempDir::new().unwrap();
            let svc = service(&dir, LEASE_MS, 1).await;
            let (owner, project, lease) = project_with_lease(&svc).await;

            let resp = svc.complete_job(failed(&lease, false)).await.unwrap();
            assert!(resp.ok);
            let view = svc.get_job(&owner, &lease.job_id).await.unwrap();
            assert_eq!(view.status, JobStatus::Failed);

            let resp = svc.complete_job(failed(&lease, false)).await.unwrap();
            assert_eq!(resp.message.as_deref(), Some("already completed"));

            let replies = assistant_replies(&svc, &project.project_id).await;
            assert_eq!(replies.len(), 1);
            assert_eq!(replies[0].message_type, MessageType::Error);
            assert_eq!(replies[0].content, ERROR_REPLY);
        }

        #[tokio::test]
        async fn failure_after_a_saved_reply_keeps_that_reply() {
            let dir = TempDir::new().unwrap();
            let svc = service(&dir, LEASE_MS, 1).await;
            let (_, project, lease) = project_with_lease(&svc).await;

            svc.persist_message(PersistMessageRequest {
                job_id: lease.job_id.clone(),
                lease_token: lease.lease_token.clone(),
                message: result_reply(&project.project_id),
            })
            .await
            .unwrap();
            svc.complete_job(failed(&lease, false)).await.unwrap();

            let replies = assistant_replies(&svc, &project.project_id).await;
            assert_eq!(replies.len(), 1);
            assert_eq!(replies[0].message_type, MessageType::Result);
            let fragment = replies[0].fragment.as_ref().unwrap();
            assert_eq!(fragment.title, "Todo App");
            assert_eq!(fragment.files["app/page.tsx"], "export {}");
        }

        #[tokio::test]
        async fn retried_attempt_does_not_duplicate_the_reply() {
            let dir = TempDir::new().unwrap();
            let svc = service(&dir, LEASE_MS, 3).await;
            let (_, project, first) = project_with_lease(&svc).await;

            let persist = |lease: &JobLease| PersistMessageRequest {
                job_id: lease.job_id.clone(),
                lease_token: lease.lease_token.clone(),
                message: result_reply(&project.project_id),
            };
            let saved = svc.persist_message(persist(&first)).await.unwrap();
            svc.complete_job(failed(&first, false)).await.unwrap();

            let second = svc.claim_job("agent-1".into()).await.unwrap().unwrap();
            assert_eq!(second.attempt, 2);
            let again = svc.persist_message(persist(&second)).await.unwrap();
            assert_eq!(again.message_id, saved.message_id);

            let err = svc.persist_message(persist(&first)).await.unwrap_err();
            assert!(matches!(err, ServiceError::Conflict(_)));
            assert_eq!(assistant_replies(&svc, &project.project_id).await.len(), 1);
        }

        #[tokio::test]
        async fn non_retryable_failure_ends_the_job_at_once() {
            let dir = TempDir::new().unwrap();
            let svc = service(&dir, LEASE_MS, 3).await;
            let (owner, project, lease) = project_with_lease(&svc).await;

            svc.complete_job(failed(&lease, true)).await.unwrap();

            let view = svc.get_job(&owner, &lease.job_id).await.unwrap();
            assert_eq!(view.status, JobStatus::Failed);
            assert_eq!(view.attempt, 1);
            assert!(svc.claim_job("agent-1".into()).await.unwrap().is_none());
            assert_eq!(assistant_replies(&svc, &project.project_id).await.len(), 1);
        }

        #[tokio::test]
        async fn agent_access_is_fenced_by_lease_and_project() {
            let dir = TempDir::new().unwrap();
            let svc = service(&dir, LEASE_MS, 3).await;
            let (_, project, lease) = project_with_lease(&svc).await;
            let other = svc
                .create_project(
                    &caller("user_2", Plan::Pro),
                    CreateProjectRequest {
                        value: "someone else's app".into(),
                    },
                )
                .await
                .unwrap();

            let stale = svc
                .put_step(&lease.job_id, "get-sandbox-id", "stale", serde_json::json!({"data": "s1"}))
                .await
                .unwrap_err();
            assert!(matches!(stale, ServiceError::Conflict(_)));
            let stale = svc
                .get_step(&lease.job_id, "get-sandbox-id", "stale")
                .await
                .unwrap_err();
            assert!(matches!(stale, ServiceError::Conflict(_)));

            svc.put_step(
                &lease.job_id,
                "get-sandbox-id",
                &lease.lease_token,
                serde_json::json!({"data": "s1"}),
            )
            .await
            .unwrap();
            let stored = svc
                .get_step(&lease.job_id, "get-sandbox-id", &lease.lease_token)
                .await
                .unwrap();
            assert_eq!(stored, Some(serde_json::json!({"data": "s1"})));

            let find = |project_id: &str| FindMessagesRequest {
                job_id: lease.job_id.clone(),
                lease_token: lease.lease_token.clone(),
                project_id: project_id.into(),
                limit: 10,
            };
            let own = svc.find_job_messages(find(&project.project_id)).await.unwrap();
            assert_eq!(own.len(), 1);
            let err = svc
                .find_job_messages(find(&other.project_id))
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::Conflict(_)));

            let err = svc
                .persist_message(PersistMessageRequest {
                    job_id: lease.job_id.clone(),
                    lease_token: lease.lease_token.clone(),
                    message: result_reply(&other.project_id),
                })
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::Conflict(_)));
            assert!(assistant_replies(&svc, &other.project_id).await.is_empty());
        }

        #[tokio::test]
        async fn raw_events_need_an_owned_project_and_credit() {
            let dir = TempDir::new().unwrap();
            let svc = service(&dir, LEASE_MS, 3).await;
            let owner = caller("user_1", Plan::Free);
            let project = svc
                .create_project(
                    &owner,
                    CreateProjectRequest {
                        value: "a todo app".into(),
                    },
                )
                .await
                .unwrap();
            let event = || SendEventRequest {
                name: CODE_AGENT_RUN_EVENT.into(),
                data: serde_json::json!({ "value": "add dark mode", "projectId": project.project_id }),
            };

            let err = svc
                .send_raw_event(&caller("user_2", Plan::Pro), event())
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::NotFound(_)));

            let job_id = svc.send_raw_event(&owner, event()).await.unwrap();
            assert_eq!(svc.get_job(&owner, &job_id).await.unwrap().status, JobStatus::Queued);
            let err = svc
                .get_job(&caller("user_2", Plan::Pro), &job_id)
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::NotFound(_)));

            let err = svc.send_raw_event(&owner, event()).await.unwrap_err();
            assert!(matches!(err, ServiceError::Usage(_)));
        }

        #[tokio::test]
        async fn expired_leases_are_requeued_with_backoff() {
            let dir = TempDir::new().unwrap();
            let svc = service(&dir, 0, 3).await;
            let (owner, _, first) = project_with_lease(&svc).await;

            tokio::time::sleep(Duration::from_millis(10)).await;
            svc.reconcile().await.unwrap();
            let view = svc.get_job(&owner, &first.job_id).await.unwrap();
            assert_eq!(view.status, JobStatus::Queued);
            assert_eq!(view.error.as_deref(), Some("lease expired"));

            let second = svc.claim_job("agent-2".into()).await.unwrap().unwrap();
            assert_eq!(second.attempt, 2);
            assert_ne!(second.lease_token, first.lease_token);

            tokio::time::sleep(Duration::from_millis(10)).await;
            svc.reconcile().await.unwrap();
            assert!(svc.claim_job("agent-2".into()).await.unwrap().is_none());
        }
    }
}
