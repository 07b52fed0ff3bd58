//! Tools the coding agent can call against its sandbox.
//!
//! Each invocation is a durable step. Tool failures are returned to the model
//! as tagged outcomes rather than raised, so the agent can react to them.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use builder_core::model::FileMap;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::JobError;
use crate::llm::{ToolCall, ToolSpec};
use crate::sandbox::{Sandbox, SandboxHandle};
use crate::state::RunState;
use crate::steps::StepContext;

pub const TERMINAL: &str = "terminal";
pub const CREATE_OR_UPDATE_FILES: &str = "createOrUpdateFiles";
pub const READ_FILE: &str = "readFile";

/// Step name of a read batch.
pub const READ_FILES_STEP: &str = "readFiles";

/// A file path and its content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub content: String,
}

#[derive(Deserialize)]
struct TerminalArgs {
    command: String,
}

#[derive(Deserialize)]
struct WriteArgs {
    files: Vec<FileEntry>,
}

#[derive(Deserialize)]
struct ReadArgs {
    files: Vec<String>,
}

/// A decoded tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolRequest {
    Terminal { command: String },
    CreateOrUpdateFiles { files: Vec<FileEntry> },
    ReadFile { paths: Vec<String> },
}

impl ToolRequest {
    pub fn parse(call: &ToolCall) -> Result<Self, String> {
        let raw = if call.arguments.trim().is_empty() {
            "{}"
        } else {
            call.arguments.as_str()
        };
        let parsed = match call.name.as_str() {
            TERMINAL => serde_json::from_str::<TerminalArgs>(raw)
                .map(|a| ToolRequest::Terminal { command: a.command }),
            CREATE_OR_UPDATE_FILES => serde_json::from_str::<WriteArgs>(raw)
                .map(|a| ToolRequest::CreateOrUpdateFiles { files: a.files }),
            READ_FILE => serde_json::from_str::<ReadArgs>(raw)
                .map(|a| ToolRequest::ReadFile { paths: a.files }),
            other => return Err(format!("unknown tool: {other}")),
        };
        parsed.map_err(|e| format!("invalid arguments for {}: {e}", call.name))
    }
}

/// Result of one tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome<T> {
    Complete { output: T },
    /// Part of a batch succeeded before `error` stopped it.
    Partial { output: T, error: String },
    Failed { error: String },
}

impl<T> ToolOutcome<T> {
    pub fn output(&self) -> Option<&T> {
        match self {
            ToolOutcome::Complete { output } | ToolOutcome::Partial { output, .. } => Some(output),
            ToolOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ToolOutcome::Complete { .. } => None,
            ToolOutcome::Partial { error, .. } | ToolOutcome::Failed { error } => Some(error),
        }
    }
}

/// Tool schemas advertised to the model.
pub fn specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: TERMINAL.into(),
            description: "Use the terminal to run commands".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string" }
                },
                "required": ["command"]
            }),
        },
        ToolSpec {
            name: CREATE_OR_UPDATE_FILES.into(),
            description: "Create or update files in the sandbox".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "files": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "path": { "type": "string" },
                                "content": { "type": "string" }
                            },
                            "required": ["path", "content"]
                        }
                    }
                },
                "required": ["files"]
            }),
        },
        ToolSpec {
            name: READ_FILE.into(),
            description: "Read files from the sandbox".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "files": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["files"]
            }),
        },
    ]
}

/// Tools bound to one sandbox session.
pub struct ToolSet {
    sandbox: Arc<dyn Sandbox>,
    session_id: String,
    timeout: Duration,
}

impl ToolSet {
    pub fn new(sandbox: Arc<dyn Sandbox>, session_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            sandbox,
            session_id: session_id.into(),
            timeout,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Every tool call reconnects and refreshes the session lifetime.
    async fn connect(&self) -> Result<SandboxHandle, crate::sandbox::SandboxError> {
        SandboxHandle::connect(self.sandbox.clone(), &self.session_id, self.timeout).await
    }

    /// Execute a model tool call and render the text returned to the model.
    ///
    /// Only step-log failures surface as errors.
    pub async fn invoke(
        &self,
        call: &ToolCall,
        state: &mut RunState,
        steps: &mut StepContext,
    ) -> Result<String, JobError> {
        let request = match ToolRequest::parse(call) {
            Ok(request) => request,
            Err(error) => {
                tracing::warn!(tool = %call.name, %error, "rejected tool call");
                return Ok(format!("Error: {error}"));
            }
        };

        tracing::debug!(tool = %call.name, call_id = %call.id, "invoking tool");
        let text = match request {
            ToolRequest::Terminal { command } => match self.terminal(&command, steps).await? {
                ToolOutcome::Complete { output } => output,
                ToolOutcome::Partial { error, .. } | ToolOutcome::Failed { error } => error,
            },
            ToolRequest::CreateOrUpdateFiles { files } => {
                let paths: Vec<String> = files.iter().map(|f| f.path.clone()).collect();
                let outcome = self.create_or_update_files(files, state, steps).await?;
                render_write(&paths, &outcome)
            }
            ToolRequest::ReadFile { paths } => render_read(&self.read_files(paths, steps).await?),
        };
        Ok(text)
    }

    /// Run a shell command. A command that ran but failed is a partial
    /// outcome carrying its stdout and a diagnostic with both buffers; a
    /// session that cannot run it at all is a failure.
    pub async fn terminal(
        &self,
        command: &str,
        steps: &mut StepContext,
    ) -> Result<ToolOutcome<String>, JobError> {
        steps
            .run(TERMINAL, || async {
                let output = match self.connect().await {
                    Ok(sandbox) => sandbox.run(command).await,
                    Err(e) => Err(e),
                };
                let outcome = match output {
                    Ok(out) => match &out.error {
                        None => ToolOutcome::Complete { output: out.stdout },
                        Some(error) => ToolOutcome::Partial {
                            error: command_failed(error, &out.stdout, &out.stderr),
                            output: out.stdout,
                        },
                    },
                    Err(e) => ToolOutcome::Failed {
                        error: command_failed(&e.to_string(), "", ""),
                    },
                };
                Ok::<_, Infallible>(outcome)
            })
            .await
    }

    /// Write a batch of files in order. Writes that succeeded before a
    /// failure are kept and committed to the state.
    ///
    /// The outcome carries the full accumulated file map.
    pub async fn create_or_update_files(
        &self,
        files: Vec<FileEntry>,
        state: &mut RunState,
        steps: &mut StepContext,
    ) -> Result<ToolOutcome<FileMap>, JobError> {
        let existing = state.files().clone();
        let outcome = steps
            .run(CREATE_OR_UPDATE_FILES, move || async move {
                let sandbox = match self.connect().await {
                    Ok(sandbox) => sandbox,
                    Err(e) => {
                        return Ok::<_, Infallible>(ToolOutcome::Failed {
                            error: e.to_string(),
                        })
                    }
                };
                let mut updated = existing;
                for file in files {
                    if let Err(e) = sandbox.write_file(&file.path, &file.content).await {
                        return Ok(ToolOutcome::Partial {
                            output: updated,
                            error: format!("failed to write {}: {e}", file.path),
                        });
                    }
                    updated.insert(file.path, file.content);
                }
                Ok(ToolOutcome::Complete { output: updated })
            })
            .await?;

        if let Some(files) = outcome.output() {
            state.merge_files(files.clone());
        }
        if let Some(error) = outcome.error() {
            tracing::warn!(%error, "file batch stopped early");
        }
        Ok(outcome)
    }

    /// Read a batch of files in order. Files read before a failure are
    /// returned with the error.
    pub async fn read_files(
        &self,
        paths: Vec<String>,
        steps: &mut StepContext,
    ) -> Result<ToolOutcome<Vec<FileEntry>>, JobError> {
        steps
            .run(READ_FILES_STEP, move || async move {
                let sandbox = match self.connect().await {
                    Ok(sandbox) => sandbox,
                    Err(e) => {
                        return Ok::<_, Infallible>(ToolOutcome::Failed {
                            error: e.to_string(),
                        })
                    }
                };
                let mut contents = Vec::with_capacity(paths.len());
                for path in paths {
                    match sandbox.read_file(&path).await {
                        Ok(content) => contents.push(FileEntry { path, content }),
                        Err(e) => {
                            return Ok(ToolOutcome::Partial {
                                output: contents,
                                error: e.to_string(),
                            })
                        }
                    }
                }
                Ok(ToolOutcome::Complete { output: contents })
            })
            .await
    }
}

fn command_failed(error: &str, stdout: &str, stderr: &str) -> String {
    tracing::error!(%error, "terminal command failed");
    format!("Command failed: {error} \n stdout: {stdout} \n stderr: {stderr}")
}

fn render_write(paths: &[String], outcome: &ToolOutcome<FileMap>) -> String {
    match outcome {
        ToolOutcome::Complete { .. } => format!("Updated files: {}", paths.join(", ")),
        ToolOutcome::Partial { output, error } => {
            let written: Vec<&str> = paths
                .iter()
                .filter(|p| output.contains_key(p.as_str()))
                .map(String::as_str)
                .collect();
            format!(
                "Error: {error}\nFiles written before the failure: {}",
                written.join(", ")
            )
        }
        ToolOutcome::Failed { error } => format!("Error: {error}"),
    }
}

fn render_read(outcome: &ToolOutcome<Vec<FileEntry>>) -> String {
    let encode = |files: &Vec<FileEntry>| serde_json::to_string(files).unwrap_or_default();
    match outcome {
        ToolOutcome::Complete { output } => encode(output),
        ToolOutcome::Partial { output, error } => {
            format!("Error: {error}\nFiles read before the failure: {}", encode(output))
        }
        ToolOutcome::Failed { error } => format!("Error: {error}"),
    }
}
