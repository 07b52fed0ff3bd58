//! Input checks shared by the HTTP layer and the event bus.

use thiserror::Error;

use crate::api::{CreateMessageRequest, CreateProjectRequest};
use crate::model::CodeAgentRun;

/// Upper bound on prompt length, in characters.
pub const MAX_PROMPT_CHARS: usize = 10_000;

/// Rejected user input.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The named field is empty.
    #[error("{0} cannot be empty")]
    Empty(&'static str),
    /// The named field exceeds `max` characters.
    #[error("{field} is too long (max {max} characters)")]
    TooLong {
        /// Field name.
        field: &'static str,
        /// Limit in characters.
        max: usize,
    },
    /// No project id was given.
    #[error("project id is required")]
    MissingProjectId,
}

/// Validate a new-project prompt.
pub fn validate_create_project(req: &CreateProjectRequest) -> Result<(), ValidationError> {
    validate_prompt("project name", &req.value)
}

/// Validate a follow-up message.
pub fn validate_create_message(req: &CreateMessageRequest) -> Result<(), ValidationError> {
    validate_prompt("message", &req.value)?;
    validate_project_id(&req.project_id)
}

/// Validate a raw `code-agent/run` payload before it is queued.
pub fn validate_event(event: &CodeAgentRun) -> Result<(), ValidationError> {
    validate_prompt("value", &event.value)?;
    validate_project_id(&event.project_id)
}

fn validate_prompt(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty(field));
    }
    if value.chars().count() > MAX_PROMPT_CHARS {
        return Err(ValidationError::TooLong {
            field,
            max: MAX_PROMPT_CHARS,
        });
    }
    Ok(())
}

fn validate_project_id(project_id: &str) -> Result<(), ValidationError> {
    if project_id.trim().is_empty() {
        return Err(ValidationError::MissingProjectId);
    }
    Ok(())
}
