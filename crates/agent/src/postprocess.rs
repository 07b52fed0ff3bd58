use std::sync::Arc;

use crate::error::JobError;
use crate::llm::{ChatMessage, ChatModel, ModelReply};
use crate::prompt::{FRAGMENT_TITLE_PROMPT, RESPONSE_PROMPT};
use crate::steps::StepContext;

pub const FRAGMENT_TITLE_STEP: &str = "fragment-title-generator";
pub const RESPONSE_STEP: &str = "response-generator";

/// Title used when the title agent produces no text.
pub const DEFAULT_TITLE: &str = "Fragment";
/// Reply used when the response agent produces no text.
pub const DEFAULT_RESPONSE: &str = "Here you go";

/// User-facing text derived from a task summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostProcessed {
    pub title: String,
    pub response: String,
}

impl Default for PostProcessed {
    fn default() -> Self {
        Self {
            title: DEFAULT_TITLE.into(),
            response: DEFAULT_RESPONSE.into(),
        }
    }
}

/// Two single-shot, tool-less agents run in sequence over the summary.
pub struct PostProcessor {
    model: Arc<dyn ChatModel>,
}

impl PostProcessor {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    pub async fn run(
        &self,
        summary: &str,
        steps: &mut StepContext,
    ) -> Result<PostProcessed, JobError> {
        let title = self
            .single_shot(FRAGMENT_TITLE_STEP, FRAGMENT_TITLE_PROMPT, summary, steps)
            .await?;
        let response = self
            .single_shot(RESPONSE_STEP, RESPONSE_PROMPT, summary, steps)
            .await?;

        let defaults = PostProcessed::default();
        Ok(PostProcessed {
            title: title.unwrap_or(defaults.title),
            response: response.unwrap_or(defaults.response),
        })
    }

    async fn single_shot(
        &self,
        step: &str,
        system: &str,
        summary: &str,
        steps: &mut StepContext,
    ) -> Result<Option<String>, JobError> {
        let messages = vec![
            ChatMessage::System {
                content: system.to_string(),
            },
            ChatMessage::User {
                content: summary.to_string(),
            },
        ];
        let reply: ModelReply = steps
            .run(step, || self.model.complete(&messages, &[]))
            .await?;
        Ok(reply.text().map(|text| text.trim().to_string()))
    }
}
