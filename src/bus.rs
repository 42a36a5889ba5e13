use serde::{ Deserialize, Serialize };
use tokio::sync::broadcast;

use crate::models::chat::ChatMessage;

const BUS_CAPACITY: usize = 256;

/// Payload of an `onMessageReceived` push.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    pub conversation_id: String,
    pub message: ChatMessage,
}

#[derive(Clone)]
pub struct MessageBus {
    sender: broadcast::Sender<MessageEvent>,
}

impl MessageBus {
    pub fn new() -> Self {
        let (sender, _rx) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Returns how many subscribers saw the event.
    pub fn publish(&self, event: MessageEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MessageEvent> {
        self.sender.subscribe()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
