//! Conversation persistence contract
//!
//! Message order in storage matches conversation order: user, assistant
//! (with tool calls), tool results, final assistant.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use volition_llm::{Role, ToolCall, ToolResultBlock, Usage};

/// A conversation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Conversation id
    pub id: Uuid,
    /// Owning agent
    pub agent_id: String,
    /// Display title, derived from the first user message
    pub title: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// One persisted message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Message id
    pub id: Uuid,
    /// Conversation this message belongs to
    pub conversation_id: Uuid,
    /// Sender role
    pub role: Role,
    /// Text content
    pub content: String,
    /// Tool calls requested by an assistant message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Full tool results (never the compacted working-context variant)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResultBlock>,
    /// Token usage of the backend call that produced this message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<Usage>,
    /// Names of attachments carried on this message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    /// Model that produced an assistant message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    /// Build a message for a conversation, stamped now.
    #[must_use]
    pub fn new(conversation_id: Uuid, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            token_usage: None,
            attachments: Vec::new(),
            model: None,
            created_at: Utc::now(),
        }
    }
}

/// Storage for conversations and their transcripts.
#[async_trait::async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create the conversation record if it does not exist yet.
    async fn ensure_conversation(&self, id: Uuid, agent_id: &str) -> Result<Conversation>;

    /// Append a message to its conversation.
    async fn append_message(&self, message: StoredMessage) -> Result<()>;

    /// Full transcript in append order.
    async fn history(&self, conversation_id: Uuid) -> Result<Vec<StoredMessage>>;

    /// Number of messages in a conversation.
    async fn message_count(&self, conversation_id: Uuid) -> Result<usize>;

    /// Set the conversation title.
    async fn set_title(&self, conversation_id: Uuid, title: &str) -> Result<()>;
}

/// In-memory conversation store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryConversationStore {
    conversations: DashMap<Uuid, Conversation>,
    messages: DashMap<Uuid, Vec<StoredMessage>>,
}

impl MemoryConversationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn ensure_conversation(&self, id: Uuid, agent_id: &str) -> Result<Conversation> {
        let conversation = self
            .conversations
            .entry(id)
            .or_insert_with(|| Conversation {
                id,
                agent_id: agent_id.to_string(),
                title: None,
                created_at: Utc::now(),
            })
            .clone();
        Ok(conversation)
    }

    async fn append_message(&self, message: StoredMessage) -> Result<()> {
        self.messages
            .entry(message.conversation_id)
            .or_default()
            .push(message);
        Ok(())
    }

    async fn history(&self, conversation_id: Uuid) -> Result<Vec<StoredMessage>> {
        Ok(self
            .messages
            .get(&conversation_id)
            .map(|m| m.clone())
            .unwrap_or_default())
    }

    async fn message_count(&self, conversation_id: Uuid) -> Result<usize> {
        Ok(self
            .messages
            .get(&conversation_id)
            .map(|m| m.len())
            .unwrap_or(0))
    }

    async fn set_title(&self, conversation_id: Uuid, title: &str) -> Result<()> {
        let mut conversation = self
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| Error::Storage(format!("conversation {conversation_id} not found")))?;
        conversation.title = Some(title.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let store = MemoryConversationStore::new();
        let id = Uuid::new_v4();
        let a = store.ensure_conversation(id, "joi").await.unwrap();
        store.set_title(id, "hello").await.unwrap();
        // Re-ensuring never resets an existing record
        let b = store.ensure_conversation(id, "joi").await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.title.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn history_preserves_append_order() {
        let store = MemoryConversationStore::new();
        let id = Uuid::new_v4();
        store.ensure_conversation(id, "joi").await.unwrap();
        store
            .append_message(StoredMessage::new(id, Role::User, "hi"))
            .await
            .unwrap();
        store
            .append_message(StoredMessage::new(id, Role::Assistant, "hello"))
            .await
            .unwrap();
        let history = store.history(id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(store.message_count(id).await.unwrap(), 2);
    }
}
