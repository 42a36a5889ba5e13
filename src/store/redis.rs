use async_trait::async_trait;
use log::error;
use redis::{ AsyncCommands, Client };

use super::{ sort_recent_first, ConversationStore };
use crate::error::RelayError;
use crate::models::chat::{ ChatMessage, Conversation, ConversationSummary };

pub struct RedisConversationStore {
    client: Client,
    key_prefix: String,
}

impl RedisConversationStore {
    pub fn new(host: &str, key_prefix: &str) -> Result<Self, RelayError> {
        Ok(Self {
            client: Client::open(host)?,
            key_prefix: key_prefix.to_string(),
        })
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    fn meta_key(&self, conversation_id: &str) -> String {
        format!("{}{}:meta", self.key_prefix, conversation_id)
    }

    fn messages_key(&self, conversation_id: &str) -> String {
        format!("{}{}:messages", self.key_prefix, conversation_id)
    }

    fn index_key(&self) -> String {
        format!("{}index", self.key_prefix)
    }

    async fn load_meta(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        conversation_id: &str
    ) -> Result<Option<Conversation>, RelayError> {
        let raw: Option<String> = conn.get(self.meta_key(conversation_id)).await?;
        match raw {
            Some(json) =>
                serde_json
                    ::from_str::<Conversation>(&json)
                    .map(Some)
                    .map_err(|e| RelayError::Store(format!("corrupt conversation {}: {}", conversation_id, e))),
            None => Ok(None),
        }
    }

    async fn save_meta(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        conversation: &Conversation
    ) -> Result<(), RelayError> {
        let meta = Conversation { messages: Vec::new(), ..conversation.clone() };
        let json = serde_json::to_string(&meta).map_err(|e| RelayError::Store(e.to_string()))?;
        let _: () = conn.set(self.meta_key(&conversation.id), json).await?;
        Ok(())
    }

    async fn load_messages(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        conversation_id: &str
    ) -> Result<Vec<ChatMessage>, RelayError> {
        let entries: Vec<String> = conn.lrange(self.messages_key(conversation_id), 0, -1).await?;
        let mut messages = Vec::with_capacity(entries.len());
        for entry in &entries {
            match serde_json::from_str::<ChatMessage>(entry) {
                Ok(msg) => messages.push(msg),
                Err(e) => error!("Error parsing stored message: {}", e),
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl ConversationStore for RedisConversationStore {
    async fn create(&self) -> Result<Conversation, RelayError> {
        let mut conn = self.get_connection().await?;
        let conversation = Conversation::new();
        self.save_meta(&mut conn, &conversation).await?;
        let _: i64 = conn.sadd(self.index_key(), &conversation.id).await?;
        Ok(conversation)
    }

    async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>, RelayError> {
        let mut conn = self.get_connection().await?;
        match self.load_meta(&mut conn, conversation_id).await? {
            Some(mut conversation) => {
                conversation.messages = self.load_messages(&mut conn, conversation_id).await?;
                Ok(Some(conversation))
            }
            None => Ok(None),
        }
    }

    async fn append(
        &self,
        conversation_id: &str,
        message: ChatMessage
    ) -> Result<Conversation, RelayError> {
        let mut conn = self.get_connection().await?;
        let mut conversation = self
            .load_meta(&mut conn, conversation_id).await?
            .ok_or_else(|| RelayError::Store(format!("conversation {} not found", conversation_id)))?;

        let json = serde_json::to_string(&message).map_err(|e| RelayError::Store(e.to_string()))?;
        conversation.push(message);
        self.save_meta(&mut conn, &conversation).await?;
        let _: i64 = conn.rpush(self.messages_key(conversation_id), json).await?;

        conversation.messages = self.load_messages(&mut conn, conversation_id).await?;
        Ok(conversation)
    }

    async fn delete(&self, conversation_id: &str) -> Result<bool, RelayError> {
        let mut conn = self.get_connection().await?;
        let removed: i64 = conn
            .del(vec![self.meta_key(conversation_id), self.messages_key(conversation_id)]).await?;
        let _: i64 = conn.srem(self.index_key(), conversation_id).await?;
        Ok(removed > 0)
    }

    async fn list(&self) -> Result<Vec<ConversationSummary>, RelayError> {
        let mut conn = self.get_connection().await?;
        let ids: Vec<String> = conn.smembers(self.index_key()).await?;
        let mut summaries = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(conversation) = self.load_meta(&mut conn, id).await? {
                summaries.push(conversation.summary());
            }
        }
        sort_recent_first(&mut summaries);
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_share_the_prefix() {
        let store = RedisConversationStore::new("redis://127.0.0.1:6379", "academia:").unwrap();
        assert_eq!(store.meta_key("c1"), "academia:c1:meta");
        assert_eq!(store.messages_key("c1"), "academia:c1:messages");
        assert_eq!(store.index_key(), "academia:index");
    }
}
