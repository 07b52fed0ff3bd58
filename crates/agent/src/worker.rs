//! Claim loop: lease a job, run it, report the outcome.

use std::sync::Arc;
use std::time::Duration;

use builder_core::model::{JobLease, JobOutcome};

use crate::job::CodeAgentJob;
use crate::remote::DaemonClient;
use crate::steps::{StepContext, StepStore};
use crate::store::MessageStore;

/// Worker loop settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub agent_id: String,
    pub poll: Duration,
    pub heartbeat: Duration,
    /// Claim and run at most one job, then return.
    pub once: bool,
}

/// Run the claim loop until `once` is satisfied (or forever).
pub async fn run_worker(
    client: DaemonClient,
    job: Arc<CodeAgentJob>,
    cfg: WorkerConfig,
) -> anyhow::Result<()> {
    loop {
        let lease = match client.claim(&cfg.agent_id).await {
            Ok(lease) => lease,
            Err(err) => {
                tracing::warn!(error = %err, "claim failed");
                tokio::time::sleep(cfg.poll).await;
                continue;
            }
        };

        let Some(lease) = lease else {
            if cfg.once {
                return Ok(());
            }
            tokio::time::sleep(cfg.poll).await;
            continue;
        };

        tracing::info!(
            job_id = %lease.job_id,
            project_id = %lease.event.project_id,
            attempt = lease.attempt,
            "claimed job"
        );

        let outcome = execute(&client, &job, &cfg, &lease).await;
        match client.complete(&cfg.agent_id, &lease, outcome).await {
            Ok(resp) if resp.ok => tracing::info!(job_id = %lease.job_id, "completed job"),
            Ok(resp) => tracing::warn!(
                job_id = %lease.job_id,
                message = ?resp.message,
                "completion rejected"
            ),
            Err(err) => tracing::warn!(job_id = %lease.job_id, error = %err, "completion failed"),
        }

        if cfg.once {
            return Ok(());
        }
    }
}

async fn execute(
    client: &DaemonClient,
    job: &CodeAgentJob,
    cfg: &WorkerConfig,
    lease: &JobLease,
) -> JobOutcome {
    let channel = Arc::new(client.job_channel(lease));
    let heartbeat = tokio::spawn(keep_alive(
        client.clone(),
        cfg.agent_id.clone(),
        lease.clone(),
        cfg.heartbeat,
    ));

    let store: Arc<dyn MessageStore> = channel.clone();
    let step_store: Arc<dyn StepStore> = channel;
    let mut steps = StepContext::new(lease.job_id.clone(), step_store);
    let result = job.run(&lease.event, store, &mut steps).await;
    heartbeat.abort();

    tracing::debug!(
        job_id = %lease.job_id,
        replayed = steps.replayed(),
        executed = steps.executed(),
        "step log"
    );

    match result {
        Ok(result) => JobOutcome::Succeeded { result },
        Err(err) => {
            tracing::error!(
                job_id = %lease.job_id,
                error = %err,
                retryable = err.is_retryable(),
                "job failed"
            );
            JobOutcome::Failed {
                error: err.to_string(),
                permanent: !err.is_retryable(),
            }
        }
    }
}

async fn keep_alive(client: DaemonClient, agent_id: String, lease: JobLease, every: Duration) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(100)));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match client.heartbeat(&agent_id, &lease).await {
            Ok(resp) if resp.ok => {}
            Ok(_) => {
                tracing::warn!(job_id = %lease.job_id, "lease lost");
                return;
            }
            Err(err) => tracing::warn!(job_id = %lease.job_id, error = %err, "heartbeat failed"),
        }
    }
}
