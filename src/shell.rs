//! Per-session chat state: conversation list, message history, and the
//! single in-flight send guard.

use chrono::Utc;
use std::collections::HashMap;
use thiserror::Error;

use crate::models::chat::{
    derive_title,
    ChatMessage,
    ConversationSummary,
    Role,
    DEFAULT_TITLE,
};

pub const WELCOME_ID: &str = "welcome-chat";
pub const WELCOME_TITLE: &str = "Welcome";
pub const INTRO_TEXT: &str = "Welcome! I can help you explore post-secondary programs tailored to your field of study / interests, career goals, preferred locations, and budget.\n\nShare any details you know and I'll surface schools, programs, and cost insights that fit.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Idle,
    Sending,
    ErrorDisplayed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShellError {
    #[error("Message is required.")]
    EmptyInput,
    #[error("A message is already being sent.")]
    Busy,
    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),
    #[error("The welcome conversation cannot be deleted.")]
    Protected,
}

/// Ticket for a send that has been shown locally but not yet answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub ticket: u64,
    pub conversation_id: String,
    pub remote_id: Option<String>,
    pub prompt: String,
}

/// A finished agent turn handed back to the shell.
#[derive(Debug, Clone)]
pub struct AgentTurn {
    pub remote_id: String,
    pub message: ChatMessage,
}

#[derive(Debug)]
struct InFlight {
    conversation_id: String,
    ticket: u64,
}

pub struct ChatShell {
    conversations: HashMap<String, ConversationSummary>,
    order: Vec<String>,
    messages: HashMap<String, Vec<ChatMessage>>,
    states: HashMap<String, SendState>,
    remote_ids: HashMap<String, String>,
    active: String,
    in_flight: Option<InFlight>,
    next_ticket: u64,
}

impl ChatShell {
    pub fn new() -> Self {
        let welcome = ConversationSummary {
            id: WELCOME_ID.to_string(),
            title: WELCOME_TITLE.to_string(),
            updated_at: Utc::now(),
        };
        let mut shell = Self {
            conversations: HashMap::new(),
            order: vec![WELCOME_ID.to_string()],
            messages: HashMap::new(),
            states: HashMap::new(),
            remote_ids: HashMap::new(),
            active: WELCOME_ID.to_string(),
            in_flight: None,
            next_ticket: 0,
        };
        shell.conversations.insert(WELCOME_ID.to_string(), welcome);
        shell.messages.insert(WELCOME_ID.to_string(), vec![ChatMessage::agent(INTRO_TEXT)]);
        shell
    }

    pub fn active_id(&self) -> &str {
        &self.active
    }

    pub fn conversations(&self) -> Vec<ConversationSummary> {
        self.order
            .iter()
            .filter_map(|id| self.conversations.get(id).cloned())
            .collect()
    }

    pub fn messages(&self, conversation_id: &str) -> &[ChatMessage] {
        self.messages.get(conversation_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn state(&self, conversation_id: &str) -> SendState {
        self.states.get(conversation_id).copied().unwrap_or(SendState::Idle)
    }

    pub fn is_sending(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn create_conversation(&mut self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.conversations.insert(id.clone(), ConversationSummary {
            id: id.clone(),
            title: DEFAULT_TITLE.to_string(),
            updated_at: Utc::now(),
        });
        self.order.insert(0, id.clone());
        self.active = id.clone();
        id
    }

    pub fn select(&mut self, conversation_id: &str) -> Result<(), ShellError> {
        if !self.conversations.contains_key(conversation_id) {
            return Err(ShellError::UnknownConversation(conversation_id.to_string()));
        }
        self.active = conversation_id.to_string();
        Ok(())
    }

    /// Removes a conversation and returns its remote id, if it had one.
    pub fn delete(&mut self, conversation_id: &str) -> Result<Option<String>, ShellError> {
        if conversation_id == WELCOME_ID {
            return Err(ShellError::Protected);
        }
        if self.conversations.remove(conversation_id).is_none() {
            return Err(ShellError::UnknownConversation(conversation_id.to_string()));
        }
        self.order.retain(|id| id != conversation_id);
        self.messages.remove(conversation_id);
        self.states.remove(conversation_id);
        if self.in_flight_for(conversation_id) {
            self.in_flight = None;
        }
        if self.active == conversation_id {
            self.active = self.order.first().cloned().unwrap_or_else(|| WELCOME_ID.to_string());
        }
        Ok(self.remote_ids.remove(conversation_id))
    }

    pub fn bind_remote(&mut self, conversation_id: &str, remote_id: &str) {
        self.remote_ids.insert(conversation_id.to_string(), remote_id.to_string());
    }

    pub fn remote_id(&self, conversation_id: &str) -> Option<&str> {
        self.remote_ids.get(conversation_id).map(String::as_str)
    }

    pub fn local_for_remote(&self, remote_id: &str) -> Option<&str> {
        self.remote_ids
            .iter()
            .find(|(_, remote)| remote.as_str() == remote_id)
            .map(|(local, _)| local.as_str())
    }

    /// Shows the user's message right away and marks the active
    /// conversation as sending.
    pub fn begin_send(&mut self, input: &str) -> Result<PendingSend, ShellError> {
        let prompt = input.trim();
        if prompt.is_empty() {
            return Err(ShellError::EmptyInput);
        }
        if self.in_flight.is_some() {
            return Err(ShellError::Busy);
        }

        let conversation_id = self.active.clone();
        self.messages
            .entry(conversation_id.clone())
            .or_default()
            .push(ChatMessage::user(prompt));
        self.states.insert(conversation_id.clone(), SendState::Sending);
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.in_flight = Some(InFlight { conversation_id: conversation_id.clone(), ticket });
        self.touch(&conversation_id, prompt);

        Ok(PendingSend {
            ticket,
            remote_id: self.remote_ids.get(&conversation_id).cloned(),
            conversation_id,
            prompt: prompt.to_string(),
        })
    }

    /// Settles a pending send. Failures become a local error message.
    ///
    /// Only the ticket that holds the guard releases it: a live push may
    /// have released it already and a newer send may own it now.
    pub fn complete_send(&mut self, pending: &PendingSend, result: Result<AgentTurn, String>) {
        if self.in_flight.as_ref().is_some_and(|f| f.ticket == pending.ticket) {
            self.in_flight = None;
        }
        let id = &pending.conversation_id;
        if !self.conversations.contains_key(id) {
            // Deleted while in flight.
            return;
        }
        let superseded = self.in_flight_for(id);
        match result {
            Ok(turn) => {
                self.bind_remote(id, &turn.remote_id);
                self.append_unique(id, turn.message);
                if !superseded {
                    self.states.insert(id.clone(), SendState::Idle);
                }
            }
            Err(detail) => {
                self.messages
                    .entry(id.clone())
                    .or_default()
                    .push(ChatMessage::agent(format!("Error: {}", detail)));
                if !superseded {
                    self.states.insert(id.clone(), SendState::ErrorDisplayed);
                }
            }
        }
    }

    /// Takes an agent message pushed over the live channel. Returns whether
    /// it was new.
    pub fn receive_live(&mut self, conversation_id: &str, message: ChatMessage) -> bool {
        if message.role != Role::Agent || !self.conversations.contains_key(conversation_id) {
            return false;
        }
        let appended = self.append_unique(conversation_id, message);
        if appended && self.in_flight_for(conversation_id) {
            self.in_flight = None;
            self.states.insert(conversation_id.to_string(), SendState::Idle);
        }
        appended
    }

    fn in_flight_for(&self, conversation_id: &str) -> bool {
        self.in_flight.as_ref().is_some_and(|f| f.conversation_id == conversation_id)
    }

    fn append_unique(&mut self, conversation_id: &str, message: ChatMessage) -> bool {
        let history = self.messages.entry(conversation_id.to_string()).or_default();
        if history.iter().any(|m| m.id == message.id) {
            return false;
        }
        history.push(message);
        true
    }

    fn touch(&mut self, conversation_id: &str, prompt: &str) {
        if let Some(summary) = self.conversations.get_mut(conversation_id) {
            if summary.title == DEFAULT_TITLE {
                summary.title = derive_title(prompt);
            }
            summary.updated_at = Utc::now();
        }
        self.order.retain(|id| id != conversation_id);
        self.order.insert(0, conversation_id.to_string());
    }
}

impl Default for ChatShell {
    fn default() -> Self {
        Self::new()
    }
}
