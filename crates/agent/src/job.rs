//! Job entry point for `code-agent/run`.

use std::sync::Arc;
use std::time::Duration;

use builder_core::model::{CodeAgentRun, JobResult, MessageType, Turn};

use crate::completion::CompletionSignal;
use crate::conversation::{load_history, HISTORY_LIMIT};
use crate::error::JobError;
use crate::llm::ChatModel;
use crate::network::{CodeAgent, Network, DEFAULT_MAX_ITER};
use crate::persist::{outcome_type, ResultPersister, RunReport};
use crate::postprocess::{PostProcessed, PostProcessor};
use crate::prompt::system_prompt;
use crate::sandbox::{
    Sandbox, SandboxError, SandboxHandle, DEFAULT_SANDBOX_TIMEOUT, DEFAULT_TEMPLATE, SERVING_PORT,
};
use crate::state::RunState;
use crate::steps::StepContext;
use crate::store::MessageStore;
use crate::tools::ToolSet;

pub const SANDBOX_STEP: &str = "get-sandbox-id";
pub const HISTORY_STEP: &str = "get-previous-messages";
pub const SANDBOX_URL_STEP: &str = "get-sandbox-url";

/// Job settings.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub template: String,
    pub sandbox_timeout: Duration,
    pub max_iter: usize,
    pub history_limit: usize,
    pub serving_port: u16,
    pub completion: CompletionSignal,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            template: DEFAULT_TEMPLATE.into(),
            sandbox_timeout: DEFAULT_SANDBOX_TIMEOUT,
            max_iter: DEFAULT_MAX_ITER,
            history_limit: HISTORY_LIMIT,
            serving_port: SERVING_PORT,
            completion: CompletionSignal::default(),
        }
    }
}

/// Runs one `code-agent/run` event to a persisted outcome.
pub struct CodeAgentJob {
    sandbox: Arc<dyn Sandbox>,
    model: Arc<dyn ChatModel>,
    cfg: JobConfig,
}

impl CodeAgentJob {
    pub fn new(sandbox: Arc<dyn Sandbox>, model: Arc<dyn ChatModel>, cfg: JobConfig) -> Self {
        Self {
            sandbox,
            model,
            cfg,
        }
    }

    pub fn config(&self) -> &JobConfig {
        &self.cfg
    }

    /// Exactly one assistant message is persisted per job: RESULT with a
    /// fragment when the agent completed and wrote files, ERROR otherwise.
    /// `url` and `title` are empty on the ERROR path.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(job_id = %steps.job_id(), project_id = %event.project_id)
    )]
    pub async fn run(
        &self,
        event: &CodeAgentRun,
        store: Arc<dyn MessageStore>,
        steps: &mut StepContext,
    ) -> Result<JobResult, JobError> {
        let session_id: String = steps
            .run(SANDBOX_STEP, || async {
                let id = self.sandbox.acquire(&self.cfg.template).await?;
                self.sandbox
                    .set_timeout(&id, self.cfg.sandbox_timeout)
                    .await?;
                Ok::<_, SandboxError>(id)
            })
            .await?;
        tracing::info!(%session_id, "sandbox ready");

        let history: Vec<Turn> = steps
            .run(HISTORY_STEP, || {
                load_history(store.as_ref(), &event.project_id, self.cfg.history_limit)
            })
            .await?;

        let tools = ToolSet::new(
            self.sandbox.clone(),
            session_id.clone(),
            self.cfg.sandbox_timeout,
        );
        let agent = CodeAgent::new(
            self.model.clone(),
            system_prompt(&self.cfg.completion),
            tools,
            self.cfg.completion.clone(),
        );
        let run = Network::new(agent, self.cfg.max_iter)
            .run(&event.value, &history, RunState::new(), steps)
            .await?;
        let state = run.state;

        let persister = ResultPersister::new(store);
        let (url, title) = match (outcome_type(&state), state.summary()) {
            (MessageType::Result, Some(summary)) => {
                let post: PostProcessed = PostProcessor::new(self.model.clone())
                    .run(summary, steps)
                    .await?;
                let url = self.sandbox_url(&session_id, steps).await?;
                let report = RunReport::Success {
                    sandbox_url: url.clone(),
                    title: post.title.clone(),
                    response: post.response,
                    files: state.files().clone(),
                };
                persister.commit(&event.project_id, report, steps).await?;
                (url, post.title)
            }
            _ => {
                tracing::warn!(
                    stop = ?run.stop,
                    iterations = run.iterations,
                    files = state.files().len(),
                    "run produced no usable result"
                );
                persister
                    .commit(&event.project_id, RunReport::Failure, steps)
                    .await?;
                (String::new(), String::new())
            }
        };

        let (files, summary) = state.into_parts();
        Ok(JobResult {
            url,
            title,
            files,
            summary,
        })
    }

    async fn sandbox_url(
        &self,
        session_id: &str,
        steps: &mut StepContext,
    ) -> Result<String, JobError> {
        steps
            .run(SANDBOX_URL_STEP, || async {
                let sandbox =
                    SandboxHandle::connect(self.sandbox.clone(), session_id, self.cfg.sandbox_timeout)
                        .await?;
                Ok::<_, SandboxError>(sandbox.url_for(self.cfg.serving_port))
            })
            .await
    }
}
