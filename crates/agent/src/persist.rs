use std::sync::Arc;

use builder_core::model::{FileMap, Message, MessageType, NewFragment, NewMessage, Role};

use crate::error::JobError;
use crate::state::RunState;
use crate::steps::StepContext;
use crate::store::MessageStore;

pub const SAVE_RESULT_STEP: &str = "save-result";

pub use builder_core::model::ERROR_REPLY;

/// Kind of message a finished run produces: RESULT only when the agent both
/// completed and wrote at least one file.
pub fn outcome_type(state: &RunState) -> MessageType {
    if state.is_successful() {
        MessageType::Result
    } else {
        MessageType::Error
    }
}

/// What a finished run persists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReport {
    Success {
        sandbox_url: String,
        title: String,
        response: String,
        files: FileMap,
    },
    Failure,
}

impl RunReport {
    pub fn message_type(&self) -> MessageType {
        match self {
            RunReport::Success { .. } => MessageType::Result,
            RunReport::Failure => MessageType::Error,
        }
    }

    pub fn into_message(self, project_id: &str) -> NewMessage {
        let message_type = self.message_type();
        let (content, fragment) = match self {
            RunReport::Success {
                sandbox_url,
                title,
                response,
                files,
            } => (
                response,
                Some(NewFragment {
                    sandbox_url,
                    title,
                    files,
                }),
            ),
            RunReport::Failure => (ERROR_REPLY.to_string(), None),
        };
        NewMessage {
            project_id: project_id.to_string(),
            content,
            role: Role::Assistant,
            message_type,
            fragment,
        }
    }
}

/// Writes exactly one assistant message per job.
pub struct ResultPersister {
    store: Arc<dyn MessageStore>,
}

impl ResultPersister {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    pub async fn commit(
        &self,
        project_id: &str,
        report: RunReport,
        steps: &mut StepContext,
    ) -> Result<Message, JobError> {
        let message = report.into_message(project_id);
        let saved: Message = steps
            .run(SAVE_RESULT_STEP, move || self.store.create_message(message))
            .await?;
        tracing::info!(
            message_id = %saved.message_id,
            kind = ?saved.message_type,
            "result saved"
        );
        Ok(saved)
    }
}
