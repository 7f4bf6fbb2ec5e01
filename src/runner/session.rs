//! Conversation sessions
//!
//! In-memory message history per session id.

use crate::types::Message;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Append a completed user/assistant exchange and trim to `max_history` exchanges
    pub fn push_exchange(&mut self, user: Message, assistant: Message, max_history: usize) {
        self.messages.push(user);
        self.messages.push(assistant);
        trim_history(&mut self.messages, max_history);
        self.updated_at = Utc::now();
    }
}

/// Keep the first message plus the most recent `max_history` exchanges
pub fn trim_history(messages: &mut Vec<Message>, max_history: usize) {
    let keep = 1 + 2 * max_history;
    if messages.len() <= keep {
        return;
    }
    let excess = messages.len() - keep;
    messages.drain(1..1 + excess);
}
