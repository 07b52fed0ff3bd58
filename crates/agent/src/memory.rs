use std::collections::HashMap;

use async_trait::async_trait;
use builder_core::model::{Fragment, Message, NewMessage, Role};
use builder_core::{new_ulid, now_ms};
use tokio::sync::Mutex;

use crate::steps::StepStore;
use crate::store::{MessageStore, StoreError};

/// In-memory message and step storage. Not durable; used by tests and by
/// single-shot local runs.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    /// Insertion order is recency order.
    messages: Vec<Message>,
    steps: HashMap<String, Vec<(String, serde_json::Value)>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plain RESULT message, e.g. the user prompt that triggers a job.
    pub async fn seed(&self, project_id: &str, role: Role, content: &str) -> Message {
        let message = NewMessage {
            project_id: project_id.to_string(),
            content: content.to_string(),
            role,
            message_type: builder_core::model::MessageType::Result,
            fragment: None,
        };
        let mut inner = self.inner.lock().await;
        inner.insert(message)
    }

    /// Messages of a project, oldest first.
    pub async fn messages(&self, project_id: &str) -> Vec<Message> {
        let inner = self.inner.lock().await;
        inner
            .messages
            .iter()
            .filter(|m| m.project_id == project_id)
            .cloned()
            .collect()
    }

    /// Recorded step keys of a job in recording order.
    pub async fn step_keys(&self, job_id: &str) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .steps
            .get(job_id)
            .map(|steps| steps.iter().map(|(k, _)| k.clone()).collect())
            .unwrap_or_default()
    }
}

impl Inner {
    fn insert(&mut self, message: NewMessage) -> Message {
        let now = now_ms();
        let message_id = new_ulid().to_string();
        let fragment = message.fragment.map(|f| Fragment {
            fragment_id: new_ulid().to_string(),
            message_id: message_id.clone(),
            sandbox_url: f.sandbox_url,
            title: f.title,
            files: f.files,
            created_at_ms: now,
        });
        let stored = Message {
            message_id,
            project_id: message.project_id,
            content: message.content,
            role: message.role,
            message_type: message.message_type,
            fragment,
            created_at_ms: now,
            updated_at_ms: now,
        };
        self.messages.push(stored.clone());
        stored
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn find_messages(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .messages
            .iter()
            .rev()
            .filter(|m| m.project_id == project_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn create_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.insert(message))
    }
}

#[async_trait]
impl StepStore for InMemoryStore {
    async fn load_step(
        &self,
        job_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.steps.get(job_id).and_then(|steps| {
            steps
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        }))
    }

    async fn save_step(
        &self,
        job_id: &str,
        key: &str,
        output: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let steps = inner.steps.entry(job_id.to_string()).or_default();
        match steps.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = output,
            None => steps.push((key.to_string(), output)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn find_returns_newest_first_within_limit() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            store.seed("p1", Role::User, &format!("m{i}")).await;
        }
        store.seed("p2", Role::User, "other").await;

        let found = store.find_messages("p1", 3).await.unwrap();
        let contents: Vec<_> = found.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m4", "m3", "m2"]);
    }

    #[tokio::test]
    async fn fragment_is_attached_to_its_message() {
        let store = InMemoryStore::new();
        let saved = store
            .create_message(NewMessage {
                project_id: "p1".into(),
                content: "here".into(),
                role: Role::Assistant,
                message_type: builder_core::model::MessageType::Result,
                fragment: Some(builder_core::model::NewFragment {
                    sandbox_url: "https://3000-x.localhost".into(),
                    title: "T".into(),
                    files: Default::default(),
                }),
            })
            .await
            .unwrap();

        let fragment = saved.fragment.unwrap();
        assert_eq!(fragment.message_id, saved.message_id);
    }
}
