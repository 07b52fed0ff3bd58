//! Durable step log.
//!
//! Every externally visible unit of work runs through [`StepContext::run`].
//! A step whose key is already recorded for the job is not executed again;
//! its stored output is returned instead, so a retried job replays completed
//! work and resumes where the previous attempt stopped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::store::StoreError;

/// Storage for recorded step outputs.
#[async_trait]
pub trait StepStore: Send + Sync {
    async fn load_step(
        &self,
        job_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError>;

    /// Record a step output. Re-recording the same key overwrites it.
    async fn save_step(
        &self,
        job_id: &str,
        key: &str,
        output: serde_json::Value,
    ) -> Result<(), StoreError>;
}

#[derive(Serialize, Deserialize)]
struct Recorded<T> {
    data: T,
}

/// Per-execution view of a job's step log.
pub struct StepContext {
    job_id: String,
    store: Arc<dyn StepStore>,
    seen: HashMap<String, u32>,
    replayed: usize,
    executed: usize,
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("job_id", &self.job_id)
            .field("replayed", &self.replayed)
            .field("executed", &self.executed)
            .finish()
    }
}

impl StepContext {
    pub fn new(job_id: impl Into<String>, store: Arc<dyn StepStore>) -> Self {
        Self {
            job_id: job_id.into(),
            store,
            seen: HashMap::new(),
            replayed: 0,
            executed: 0,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Steps served from the log in this execution.
    pub fn replayed(&self) -> usize {
        self.replayed
    }

    /// Steps actually executed in this execution.
    pub fn executed(&self) -> usize {
        self.executed
    }

    /// `name` on first use, then `name:1`, `name:2`, ...
    fn next_key(&mut self, name: &str) -> String {
        let n = self.seen.entry(name.to_string()).or_insert(0);
        let key = if *n == 0 {
            name.to_string()
        } else {
            format!("{name}:{n}")
        };
        *n += 1;
        key
    }

    /// Run `f` at most once per job for this step position.
    ///
    /// Only successful outputs are recorded; a failing step runs again on the
    /// next attempt.
    pub async fn run<T, E, F, Fut>(&mut self, name: &str, f: F) -> Result<T, JobError>
    where
        T: Serialize + DeserializeOwned,
        E: Into<JobError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = self.next_key(name);

        if let Some(recorded) = self.store.load_step(&self.job_id, &key).await? {
            tracing::debug!(job_id = %self.job_id, step = %key, "replaying recorded step");
            let recorded: Recorded<T> = serde_json::from_value(recorded)
                .map_err(|source| JobError::StepDecode { key, source })?;
            self.replayed += 1;
            return Ok(recorded.data);
        }

        let output = f().await.map_err(Into::into)?;
        let value = serde_json::to_value(Recorded { data: &output }).map_err(StoreError::from)?;
        self.store.save_step(&self.job_id, &key, value).await?;
        self.executed += 1;
        tracing::debug!(job_id = %self.job_id, step = %key, "step recorded");
        Ok(output)
    }
}
