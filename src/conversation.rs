use chrono::Utc;
use log::{ error, info, warn };
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::backend::{ AgentBackend, AgentReply, AgentRequest };
use crate::bus::{ MessageBus, MessageEvent };
use crate::envelope::normalize;
use crate::error::RelayError;
use crate::models::chat::{
    is_placeholder_id,
    ChatMessage,
    Conversation,
    ConversationSummary,
    Role,
};
use crate::store::ConversationStore;

pub const NO_RESPONSE_TEXT: &str = "No response from agent";

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub conversation_id: String,
    /// Normalized reply; `None` when the agent sent nothing displayable.
    pub text: Option<String>,
    pub message: ChatMessage,
}

/// Resolves conversations and relays prompts to the agent backend. Built
/// once at startup and shared; it holds no per-request state.
#[derive(Clone)]
pub struct ConversationClient {
    store: Arc<dyn ConversationStore>,
    backend: Arc<dyn AgentBackend>,
    bus: MessageBus,
    timeout: Option<Duration>,
}

impl ConversationClient {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        backend: Arc<dyn AgentBackend>,
        bus: MessageBus,
        timeout: Option<Duration>
    ) -> Self {
        Self { store, backend, bus, timeout }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub async fn get_or_create_conversation(
        &self,
        conversation_id: Option<&str>
    ) -> Result<Conversation, RelayError> {
        self.resolve_conversation(conversation_id).await.map(|(conversation, _)| conversation)
    }

    /// Like `get_or_create_conversation`, also reporting whether the
    /// conversation was created by this call.
    async fn resolve_conversation(
        &self,
        conversation_id: Option<&str>
    ) -> Result<(Conversation, bool), RelayError> {
        let id = match conversation_id.map(str::trim) {
            Some(id) if !id.is_empty() && !is_placeholder_id(id) => id,
            _ => {
                let conversation = self.store.create().await?;
                info!("Created conversation {}", conversation.id);
                return Ok((conversation, true));
            }
        };

        match self.store.get(id).await {
            Ok(Some(conversation)) => return Ok((conversation, false)),
            Ok(None) => warn!("Conversation {} not found, creating a new one", id),
            Err(e) => warn!("Failed to fetch conversation {} ({}), creating a new one", id, e),
        }

        let conversation = self.store.create().await?;
        info!("Created conversation {} in place of {}", conversation.id, id);
        Ok((conversation, true))
    }

    pub async fn send_message(
        &self,
        conversation_id: Option<&str>,
        text: &str,
        auth_token: Option<&str>
    ) -> Result<SendOutcome, RelayError> {
        let prompt = text.trim();
        if prompt.is_empty() {
            return Err(RelayError::EmptyMessage);
        }

        let mut request = AgentRequest {
            prompt: prompt.to_string(),
            conversation_id: None,
            auth_token: auth_token.map(str::to_string),
        };
        if self.backend.requires_auth() && request.bearer().is_none() {
            warn!("Rejected send to '{}' backend without a bearer token", self.backend.name());
            return Err(RelayError::Unauthorized);
        }

        let (conversation, created) = self.resolve_conversation(conversation_id).await?;
        request.conversation_id = Some(conversation.id.clone());
        let stored_user = self.store.append(&conversation.id, ChatMessage::user(prompt)).await;
        let reply = match stored_user {
            Ok(_) => self.invoke(&request).await,
            Err(e) => Err(e),
        };
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                if created {
                    self.discard(&conversation.id).await;
                }
                return Err(e);
            }
        };

        let text = normalize(&reply.raw).filter(|t| !t.trim().is_empty());
        let message = ChatMessage {
            id: reply.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            role: Role::Agent,
            content: text.clone().unwrap_or_else(|| NO_RESPONSE_TEXT.to_string()),
            created_at: reply.created_at.unwrap_or_else(Utc::now),
        };
        self.store.append(&conversation.id, message.clone()).await?;

        self.bus.publish(MessageEvent {
            conversation_id: conversation.id.clone(),
            message: message.clone(),
        });

        Ok(SendOutcome { conversation_id: conversation.id, text, message })
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, RelayError> {
        self.store.list().await
    }

    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<bool, RelayError> {
        self.store.delete(conversation_id).await
    }

    // Drops a conversation whose first send never got a reply.
    async fn discard(&self, conversation_id: &str) {
        match self.store.delete(conversation_id).await {
            Ok(_) => info!("Discarded conversation {} after a failed send", conversation_id),
            Err(e) => error!("Failed to discard conversation {}: {}", conversation_id, e),
        }
    }

    async fn invoke(&self, request: &AgentRequest) -> Result<AgentReply, RelayError> {
        let call = self.backend.invoke(request);
        let result = match self.timeout {
            Some(limit) =>
                match tokio::time::timeout(limit, call).await {
                    Ok(result) => result,
                    Err(_) => Err(RelayError::Timeout(limit.as_secs())),
                }
            None => call.await,
        };
        if let Err(e) = &result {
            error!("Agent backend '{}' failed: {}", self.backend.name(), e);
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::echo::EchoBackend;
    use crate::store::MemoryConversationStore;
    use async_trait::async_trait;
    use serde_json::{ json, Value };
    use std::sync::atomic::{ AtomicUsize, Ordering };

    /// Scripted backend that counts how often it was called.
    pub(crate) struct ScriptedBackend {
        pub reply: Result<Value, fn() -> RelayError>,
        pub id: Option<String>,
        pub delay: Option<Duration>,
        pub needs_auth: bool,
        pub calls: AtomicUsize,
    }

    impl ScriptedBackend {
        pub(crate) fn replying(raw: Value) -> Self {
            Self { reply: Ok(raw), id: None, delay: None, needs_auth: false, calls: AtomicUsize::new(0) }
        }

        pub(crate) fn failing(err: fn() -> RelayError) -> Self {
            Self { reply: Err(err), id: None, delay: None, needs_auth: false, calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl AgentBackend for ScriptedBackend {
        async fn invoke(&self, _request: &AgentRequest) -> Result<AgentReply, RelayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.reply {
                Ok(raw) => Ok(AgentReply { id: self.id.clone(), created_at: None, raw: raw.clone() }),
                Err(make) => Err(make()),
            }
        }

        fn name(&self) -> &'static str {
            "scripted"
        }

        fn requires_auth(&self) -> bool {
            self.needs_auth
        }
    }

    /// A store whose lookups always fail.
    struct BrokenLookupStore(MemoryConversationStore);

    #[async_trait]
    impl ConversationStore for BrokenLookupStore {
        async fn create(&self) -> Result<Conversation, RelayError> {
            self.0.create().await
        }
        async fn get(&self, _id: &str) -> Result<Option<Conversation>, RelayError> {
            Err(RelayError::Store("connection reset".into()))
        }
        async fn append(&self, id: &str, m: ChatMessage) -> Result<Conversation, RelayError> {
            self.0.append(id, m).await
        }
        async fn delete(&self, id: &str) -> Result<bool, RelayError> {
            self.0.delete(id).await
        }
        async fn list(&self) -> Result<Vec<ConversationSummary>, RelayError> {
            self.0.list().await
        }
    }

    fn client_with(backend: Arc<dyn AgentBackend>) -> ConversationClient {
        ConversationClient::new(
            Arc::new(MemoryConversationStore::new()),
            backend,
            MessageBus::new(),
            None
        )
    }

    #[tokio::test]
    async fn placeholder_or_missing_id_creates() {
        let client = client_with(Arc::new(EchoBackend));
        let a = client.get_or_create_conversation(None).await.unwrap();
        let b = client.get_or_create_conversation(Some("welcome")).await.unwrap();
        let c = client.get_or_create_conversation(Some("  ")).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(b.id, c.id);
        assert_eq!(client.list_conversations().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn known_id_is_reused_and_unknown_id_recreated() {
        let client = client_with(Arc::new(EchoBackend));
        let first = client.get_or_create_conversation(None).await.unwrap();
        let again = client.get_or_create_conversation(Some(&first.id)).await.unwrap();
        assert_eq!(first.id, again.id);

        let fresh = client.get_or_create_conversation(Some("gone-123")).await.unwrap();
        assert_ne!(fresh.id, "gone-123");
    }

    #[tokio::test]
    async fn failed_lookup_falls_back_to_create() {
        let client = ConversationClient::new(
            Arc::new(BrokenLookupStore(MemoryConversationStore::new())),
            Arc::new(EchoBackend),
            MessageBus::new(),
            None
        );
        let conv = client.get_or_create_conversation(Some("conv-1")).await.unwrap();
        assert_ne!(conv.id, "conv-1");
    }

    #[tokio::test]
    async fn send_records_both_sides_and_publishes() {
        let backend = Arc::new(ScriptedBackend {
            id: Some("agent-msg-1".into()),
            ..ScriptedBackend::replying(json!({"content": [{"text": "Consider Red River College."}]}))
        });
        let client = client_with(backend.clone());
        let mut rx = client.bus().subscribe();

        let outcome = client.send_message(None, "  Manitoba trades?  ", None).await.unwrap();
        assert_eq!(outcome.text.as_deref(), Some("Consider Red River College."));
        assert_eq!(outcome.message.id, "agent-msg-1");

        let conv = client.get_or_create_conversation(Some(&outcome.conversation_id)).await.unwrap();
        assert_eq!(conv.title, "Manitoba trades?");
        assert_eq!(conv.messages.len(), 2);
        assert_eq!(conv.messages[0].role, Role::User);
        assert_eq!(conv.messages[1].content, "Consider Red River College.");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.conversation_id, outcome.conversation_id);
        assert_eq!(event.message.id, "agent-msg-1");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_reply_is_stored_with_fallback_text() {
        let client = client_with(Arc::new(ScriptedBackend::replying(Value::Null)));
        let outcome = client.send_message(None, "hello", None).await.unwrap();
        assert_eq!(outcome.text, None);
        assert_eq!(outcome.message.content, NO_RESPONSE_TEXT);
    }

    #[tokio::test]
    async fn backend_errors_propagate() {
        let client = client_with(
            Arc::new(ScriptedBackend::failing(|| RelayError::SchemaMismatch("no sendMessage".into())))
        );
        let err = client.send_message(None, "hello", None).await.unwrap_err();
        assert!(matches!(err, RelayError::SchemaMismatch(_)));
    }

    #[tokio::test]
    async fn failed_first_send_leaves_no_conversation() {
        let client = client_with(
            Arc::new(ScriptedBackend::failing(|| RelayError::Backend("throttled".into())))
        );
        for _ in 0..3 {
            assert!(client.send_message(None, "hello", None).await.is_err());
        }
        assert!(client.list_conversations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_send_keeps_existing_conversation() {
        let client = client_with(Arc::new(ScriptedBackend::failing(|| RelayError::Timeout(120))));
        let existing = client.get_or_create_conversation(None).await.unwrap();

        let err = client.send_message(Some(&existing.id), "hello", None).await.unwrap_err();
        assert!(matches!(err, RelayError::Timeout(120)));

        let listed = client.list_conversations().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, existing.id);
    }

    #[tokio::test]
    async fn token_is_checked_before_anything_is_stored() {
        let backend = Arc::new(ScriptedBackend {
            needs_auth: true,
            ..ScriptedBackend::replying(json!({"content": "ok"}))
        });
        let client = client_with(backend.clone());

        for token in [None, Some("   ")] {
            let err = client.send_message(None, "hello", token).await.unwrap_err();
            assert!(matches!(err, RelayError::Unauthorized));
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert!(client.list_conversations().await.unwrap().is_empty());

        let outcome = client.send_message(None, "hello", Some("id-token")).await.unwrap();
        assert_eq!(outcome.text.as_deref(), Some("ok"));
        assert_eq!(client.list_conversations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn blank_text_is_rejected_without_backend_call() {
        let backend = Arc::new(ScriptedBackend::replying(json!("x")));
        let client = client_with(backend.clone());
        let err = client.send_message(None, " \n\t ", None).await.unwrap_err();
        assert!(matches!(err, RelayError::EmptyMessage));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let backend = Arc::new(ScriptedBackend {
            delay: Some(Duration::from_secs(5)),
            ..ScriptedBackend::replying(json!("late"))
        });
        let client = ConversationClient::new(
            Arc::new(MemoryConversationStore::new()),
            backend,
            MessageBus::new(),
            Some(Duration::from_millis(20))
        );
        let err = client.send_message(None, "hello", None).await.unwrap_err();
        assert!(matches!(err, RelayError::Timeout(_)));
    }
}
