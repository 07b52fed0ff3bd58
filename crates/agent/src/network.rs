//! Bounded agent loop.
//!
//! The network runs one agent until the completion signal fires or the
//! iteration ceiling is reached. The router checks completion first, so a
//! summary produced on the last permitted turn still counts as completed.

use std::sync::Arc;

use builder_core::model::{Turn, TurnRole};
use serde::{Deserialize, Serialize};

use crate::completion::CompletionSignal;
use crate::error::JobError;
use crate::llm::{ChatMessage, ChatModel, ModelReply};
use crate::state::RunState;
use crate::steps::StepContext;
use crate::tools::{self, ToolSet};

/// Default iteration ceiling.
pub const DEFAULT_MAX_ITER: usize = 15;

/// Step name of one coding agent inference.
pub const INFERENCE_STEP: &str = "code-agent:inference";

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    IterationLimit,
}

/// Router decision before each turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Agent,
    Done(StopReason),
}

/// Decide the next step from the state and the number of turns already run.
pub fn route(state: &RunState, iterations: usize, max_iter: usize) -> Route {
    if state.is_complete() {
        return Route::Done(StopReason::Completed);
    }
    if iterations >= max_iter {
        return Route::Done(StopReason::IterationLimit);
    }
    Route::Agent
}

/// The coding agent: model, system prompt and tools.
pub struct CodeAgent {
    model: Arc<dyn ChatModel>,
    system: String,
    tools: ToolSet,
    completion: CompletionSignal,
}

impl CodeAgent {
    pub const NAME: &'static str = "code-agent";

    pub fn new(
        model: Arc<dyn ChatModel>,
        system: impl Into<String>,
        tools: ToolSet,
        completion: CompletionSignal,
    ) -> Self {
        Self {
            model,
            system: system.into(),
            tools,
            completion,
        }
    }

    fn initial_context(&self, history: &[Turn], input: &str) -> Vec<ChatMessage> {
        let mut context = Vec::with_capacity(history.len() + 2);
        context.push(ChatMessage::System {
            content: self.system.clone(),
        });
        context.extend(history.iter().map(|turn| match turn.role {
            TurnRole::User => ChatMessage::User {
                content: turn.content.clone(),
            },
            TurnRole::Assistant => ChatMessage::Assistant {
                content: Some(turn.content.clone()),
                tool_calls: vec![],
            },
        }));
        context.push(ChatMessage::User {
            content: input.to_string(),
        });
        context
    }

    /// One inference plus the tool calls it requested.
    async fn turn(
        &self,
        context: &mut Vec<ChatMessage>,
        state: &mut RunState,
        steps: &mut StepContext,
    ) -> Result<(), JobError> {
        let specs = tools::specs();
        let reply: ModelReply = steps
            .run(INFERENCE_STEP, || self.model.complete(&context[..], &specs))
            .await?;
        context.push(reply.to_message());

        for call in &reply.tool_calls {
            let content = self.tools.invoke(call, state, steps).await?;
            context.push(ChatMessage::Tool {
                tool_call_id: call.id.clone(),
                content,
            });
        }

        if let Some(summary) = reply.text().and_then(|text| self.completion.detect(text)) {
            if state.record_summary(summary) {
                tracing::info!(agent = Self::NAME, "task summary received");
            }
        }
        Ok(())
    }
}

/// Outcome of a network run.
#[derive(Debug, Clone)]
pub struct NetworkRun {
    pub state: RunState,
    pub iterations: usize,
    pub stop: StopReason,
}

/// Single-agent network with an iteration ceiling.
pub struct Network {
    agent: CodeAgent,
    max_iter: usize,
}

impl Network {
    pub fn new(agent: CodeAgent, max_iter: usize) -> Self {
        Self { agent, max_iter }
    }

    pub async fn run(
        &self,
        input: &str,
        history: &[Turn],
        mut state: RunState,
        steps: &mut StepContext,
    ) -> Result<NetworkRun, JobError> {
        let mut context = self.agent.initial_context(history, input);
        let mut iterations = 0;

        loop {
            if let Route::Done(stop) = route(&state, iterations, self.max_iter) {
                tracing::info!(
                    iterations,
                    ?stop,
                    files = state.files().len(),
                    "agent network finished"
                );
                return Ok(NetworkRun {
                    state,
                    iterations,
                    stop,
                });
            }
            iterations += 1;
            tracing::debug!(iteration = iterations, agent = CodeAgent::NAME, "agent turn");
            self.agent.turn(&mut context, &mut state, steps).await?;
        }
    }
}
