//! Scripted collaborators for exercising jobs without a live model.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::llm::{ChatMessage, ChatModel, ModelError, ModelReply, ToolCall, ToolSpec};

/// Plain text reply.
pub fn say(text: &str) -> ModelReply {
    ModelReply {
        text: Some(text.to_string()),
        tool_calls: vec![],
    }
}

/// Reply that only requests tool calls.
pub fn use_tools(calls: Vec<ToolCall>) -> ModelReply {
    ModelReply {
        text: None,
        tool_calls: calls,
    }
}

pub fn call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: arguments.to_string(),
    }
}

/// Model that plays back queued replies.
///
/// Calls that advertise tools are agent turns and consume `agent` replies;
/// calls without tools are single-shot completions and consume `single_shot`
/// replies. An exhausted agent queue repeats the fallback reply forever, or
/// fails with a retryable error after [`ScriptedModel::unavailable_after_script`].
pub struct ScriptedModel {
    agent: Mutex<VecDeque<ModelReply>>,
    single_shot: Mutex<VecDeque<ModelReply>>,
    fallback: Option<ModelReply>,
    calls: Mutex<Vec<Recorded>>,
}

/// One observed model call.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub messages: Vec<ChatMessage>,
    pub with_tools: bool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedModel {
    pub fn new(agent: impl IntoIterator<Item = ModelReply>) -> Self {
        Self {
            agent: Mutex::new(agent.into_iter().collect()),
            single_shot: Mutex::new(VecDeque::new()),
            fallback: Some(say("still working on it")),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_single_shot(self, replies: impl IntoIterator<Item = ModelReply>) -> Self {
        *lock(&self.single_shot) = replies.into_iter().collect();
        self
    }

    pub fn with_fallback(mut self, reply: ModelReply) -> Self {
        self.fallback = Some(reply);
        self
    }

    pub fn unavailable_after_script(mut self) -> Self {
        self.fallback = None;
        self
    }

    pub fn calls(&self) -> Vec<Recorded> {
        lock(&self.calls).clone()
    }

    pub fn agent_calls(&self) -> usize {
        lock(&self.calls).iter().filter(|c| c.with_tools).count()
    }

    pub fn single_shot_calls(&self) -> usize {
        lock(&self.calls).iter().filter(|c| !c.with_tools).count()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ModelReply, ModelError> {
        let with_tools = !tools.is_empty();
        lock(&self.calls).push(Recorded {
            messages: messages.to_vec(),
            with_tools,
        });

        let reply = if with_tools {
            let next = lock(&self.agent).pop_front().or_else(|| self.fallback.clone());
            next.ok_or_else(|| ModelError::Request {
                message: "model unavailable".into(),
                retryable: true,
            })?
        } else {
            lock(&self.single_shot).pop_front().unwrap_or_default()
        };
        Ok(reply)
    }
}

/// Model that fails every call; a replayed job must never reach it.
pub struct UnreachableModel;

#[async_trait]
impl ChatModel for UnreachableModel {
    async fn complete(&self, _: &[ChatMessage], _: &[ToolSpec]) -> Result<ModelReply, ModelError> {
        Err(ModelError::Request {
            message: "model must not be called".into(),
            retryable: false,
        })
    }
}
