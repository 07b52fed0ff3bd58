use builder_core::model::Turn;

use crate::store::{MessageStore, StoreError};

/// Number of prior messages handed to the agent.
pub const HISTORY_LIMIT: usize = 10;

/// Load up to `limit` most recent messages of a project as agent turns,
/// oldest first. Message type is ignored; ERROR replies are history too.
pub async fn load_history(
    store: &dyn MessageStore,
    project_id: &str,
    limit: usize,
) -> Result<Vec<Turn>, StoreError> {
    let mut messages = store.find_messages(project_id, limit).await?;

    // Stores hand back newest first; ties keep that order.
    messages.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
    messages.truncate(limit);
    messages.reverse();

    Ok(messages.iter().map(Turn::from).collect())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use builder_core::model::{Message, MessageType, NewMessage, Role, TurnRole};

    use super::*;
    use crate::memory::InMemoryStore;

    /// Store that returns messages in whatever order it was given.
    struct Unordered(Vec<Message>);

    #[async_trait]
    impl MessageStore for Unordered {
        async fn find_messages(&self, _: &str, _: usize) -> Result<Vec<Message>, StoreError> {
            Ok(self.0.clone())
        }

        async fn create_message(&self, _: NewMessage) -> Result<Message, StoreError> {
            Err(StoreError::Rejected("read only".into()))
        }
    }

    fn message(content: &str, role: Role, at: i64) -> Message {
        Message {
            message_id: content.to_string(),
            project_id: "p1".into(),
            content: content.to_string(),
            role,
            message_type: MessageType::Result,
            fragment: None,
            created_at_ms: at,
            updated_at_ms: at,
        }
    }

    #[tokio::test]
    async fn history_is_chronological() {
        let store = InMemoryStore::new();
        store.seed("p1", Role::User, "build a todo app").await;
        store.seed("p1", Role::Assistant, "done").await;
        store.seed("p1", Role::User, "make it blue").await;

        let turns = load_history(&store, "p1", HISTORY_LIMIT).await.unwrap();
        let contents: Vec<_> = turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["build a todo app", "done", "make it blue"]);
        assert_eq!(turns[1].role, TurnRole::Assistant);
    }

    #[tokio::test]
    async fn history_keeps_only_the_most_recent() {
        let store = InMemoryStore::new();
        for i in 0..15 {
            store.seed("p1", Role::User, &format!("m{i}")).await;
        }

        let turns = load_history(&store, "p1", HISTORY_LIMIT).await.unwrap();
        assert_eq!(turns.len(), 10);
        assert_eq!(turns.first().unwrap().content, "m5");
        assert_eq!(turns.last().unwrap().content, "m14");
    }

    #[tokio::test]
    async fn order_does_not_depend_on_store_order() {
        let store = Unordered(vec![
            message("second", Role::Assistant, 20),
            message("third", Role::User, 30),
            message("first", Role::User, 10),
        ]);

        let turns = load_history(&store, "p1", 2).await.unwrap();
        let contents: Vec<_> = turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["second", "third"]);
    }

    #[tokio::test]
    async fn empty_project_has_no_history() {
        let store = InMemoryStore::new();
        assert!(load_history(&store, "p1", HISTORY_LIMIT)
            .await
            .unwrap()
            .is_empty());
    }
}
