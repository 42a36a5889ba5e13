use serde::{ Serialize, Deserialize };

use crate::models::chat::{ ChatMessage, ConversationSummary };

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "chat")] Chat {
        content: String,
        #[serde(default, rename = "authToken")]
        auth_token: Option<String>,
    },
    #[serde(rename = "new_conversation")]
    NewConversation,
    #[serde(rename = "select_conversation")] SelectConversation {
        id: String,
    },
    #[serde(rename = "delete_conversation")] DeleteConversation {
        id: String,
    },
    #[serde(rename = "list_conversations")]
    ListConversations,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "processing")]
    Processing,
    #[serde(rename = "response")] Response {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        message: ChatMessage,
    },
    #[serde(rename = "message_received")] MessageReceived {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        message: ChatMessage,
    },
    #[serde(rename = "conversations")] Conversations {
        items: Vec<ConversationSummary>,
        #[serde(rename = "activeId")]
        active_id: String,
    },
    #[serde(rename = "error")] Error {
        message: String,
    },
}
