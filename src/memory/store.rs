//! Conversation transcript types
//!
//! Messages are immutable once created; a transcript only ever grows by
//! appending to its tail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

/// A single turn in a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Approximate token count for budget management
    pub fn token_count(&self) -> usize {
        estimate_tokens(&self.content)
    }
}

/// Rough token estimate: four bytes per token, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() + 3) / 4
}

/// Ordered conversation history for one session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transcript {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }

    /// Rebuild a transcript from persisted parts.
    pub(crate) fn from_parts(
        session_id: String,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        messages: Vec<Message>,
    ) -> Self {
        Self {
            session_id,
            created_at,
            updated_at,
            messages,
        }
    }

    /// Append a message to the tail
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Timestamped, role-labelled history for the terminal client
    pub fn get_formatted_context(&self) -> String {
        let mut context = String::new();

        for msg in &self.messages {
            let role_str = match msg.role {
                MessageRole::User => "You",
                MessageRole::Assistant => "Bot",
                MessageRole::System => "System",
            };

            context.push_str(&format!(
                "[{}] {}: {}\n",
                msg.timestamp.format("%H:%M:%S"),
                role_str,
                msg.content
            ));
        }

        context
    }
}
