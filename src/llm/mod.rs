//! Completion provider trait and implementations
//!
//! The provider is a black box: ordered chat turns in, generated text out.

use crate::memory::{Message, MessageRole};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

pub mod groq;
pub use groq::GroqClient;

/// One message as sent to the provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: MessageRole,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

impl From<&Message> for ChatTurn {
    fn from(message: &Message) -> Self {
        Self::new(message.role, message.content.clone())
    }
}

/// Trait for text completion (LLM controlled)
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, messages: &[ChatTurn], max_tokens: u32) -> Result<String>;
}

/// Scripted provider for development & testing.
///
/// Pops queued outcomes in order; once the queue is empty it echoes the last
/// user turn.
#[derive(Default)]
pub struct MockCompletionProvider {
    script: Mutex<VecDeque<Result<String>>>,
    calls: Mutex<Vec<Vec<ChatTurn>>>,
}

impl MockCompletionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful reply
    pub fn reply(self, text: impl Into<String>) -> Self {
        self.push(Ok(text.into()))
    }

    /// Queue a failure
    pub fn fail(self, error: crate::error::ChatbotError) -> Self {
        self.push(Err(error))
    }

    fn push(self, outcome: Result<String>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(outcome);
        self
    }

    /// Every message list the provider has been called with
    pub fn calls(&self) -> Vec<Vec<ChatTurn>> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl CompletionProvider for MockCompletionProvider {
    async fn complete(&self, messages: &[ChatTurn], _max_tokens: u32) -> Result<String> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(messages.to_vec());

        let next = self
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();

        match next {
            Some(outcome) => outcome,
            None => {
                let last_user = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == MessageRole::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or_default();
                Ok(format!("You said: {}", last_user))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatbotError;

    #[tokio::test]
    async fn test_mock_provider_follows_script_then_echoes() {
        let provider = MockCompletionProvider::new()
            .reply("first")
            .fail(ChatbotError::ProviderUnavailable("rate limited".into()));

        let turns = vec![ChatTurn::new(MessageRole::User, "ping")];

        assert_eq!(provider.complete(&turns, 16).await.unwrap(), "first");
        assert!(provider.complete(&turns, 16).await.is_err());
        assert_eq!(provider.complete(&turns, 16).await.unwrap(), "You said: ping");
        assert_eq!(provider.calls().len(), 3);
    }

    #[test]
    fn test_chat_turn_from_message() {
        let message = Message::assistant("hello");
        let turn = ChatTurn::from(&message);
        assert_eq!(turn.role, MessageRole::Assistant);
        assert_eq!(turn.content, "hello");
    }
}
