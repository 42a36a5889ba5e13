use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{ sort_recent_first, ConversationStore };
use crate::error::RelayError;
use crate::models::chat::{ ChatMessage, Conversation, ConversationSummary };

/// Process-local store; conversations vanish on restart.
#[derive(Default)]
pub struct MemoryConversationStore {
    conversations: RwLock<HashMap<String, Conversation>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn create(&self) -> Result<Conversation, RelayError> {
        let conversation = Conversation::new();
        self.conversations.write().await.insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>, RelayError> {
        Ok(self.conversations.read().await.get(conversation_id).cloned())
    }

    async fn append(
        &self,
        conversation_id: &str,
        message: ChatMessage
    ) -> Result<Conversation, RelayError> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| RelayError::Store(format!("conversation {} not found", conversation_id)))?;
        conversation.push(message);
        Ok(conversation.clone())
    }

    async fn delete(&self, conversation_id: &str) -> Result<bool, RelayError> {
        Ok(self.conversations.write().await.remove(conversation_id).is_some())
    }

    async fn list(&self) -> Result<Vec<ConversationSummary>, RelayError> {
        let mut summaries: Vec<ConversationSummary> = self.conversations
            .read().await
            .values()
            .map(Conversation::summary)
            .collect();
        sort_recent_first(&mut summaries);
        Ok(summaries)
    }
}
