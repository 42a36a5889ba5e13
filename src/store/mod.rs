mod memory;
mod redis;

pub use self::memory::MemoryConversationStore;
pub use self::redis::RedisConversationStore;

use async_trait::async_trait;
use log::info;
use std::sync::Arc;

use crate::cli::Args;
use crate::error::RelayError;
use crate::models::chat::{ ChatMessage, Conversation, ConversationSummary };

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create(&self) -> Result<Conversation, RelayError>;

    async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>, RelayError>;

    async fn append(
        &self,
        conversation_id: &str,
        message: ChatMessage
    ) -> Result<Conversation, RelayError>;

    async fn delete(&self, conversation_id: &str) -> Result<bool, RelayError>;

    /// Summaries, most recently updated first.
    async fn list(&self) -> Result<Vec<ConversationSummary>, RelayError>;
}

pub fn create_conversation_store(args: &Args) -> Result<Arc<dyn ConversationStore>, RelayError> {
    match args.conversation_store.to_lowercase().as_str() {
        "memory" => Ok(Arc::new(MemoryConversationStore::new())),
        "redis" => {
            let store = RedisConversationStore::new(
                &args.conversation_host,
                &args.conversation_redis_prefix
            )?;
            Ok(Arc::new(store))
        }
        other => Err(RelayError::Store(format!("Unsupported conversation store type: {}", other))),
    }
}

pub fn initialize_conversation_store(
    args: &Args
) -> Result<Arc<dyn ConversationStore>, RelayError> {
    if args.conversation_store.eq_ignore_ascii_case("memory") {
        info!("Conversations will be kept in memory");
    } else {
        info!(
            "Conversations will be stored in: {} at {}",
            args.conversation_store,
            args.conversation_host
        );
    }
    create_conversation_store(args)
}

pub(crate) fn sort_recent_first(summaries: &mut [ConversationSummary]) {
    summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
}
