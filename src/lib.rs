//! Session Chatbot
//!
//! A chatbot backend that:
//! - Keeps one durable transcript per session id
//! - Bounds the history sent to the model with a token budget
//! - Optionally grounds answers in snippets from a persisted retrieval index
//! - Serializes concurrent turns on the same session
//!
//! TURN:
//! VALIDATE → LOCK → LOAD → AUGMENT? → TRIM → COMPLETE → PERSIST → RESPOND

pub mod api;
pub mod audit;
pub mod bootstrap;
pub mod config;
pub mod conversational;
pub mod error;
pub mod llm;
pub mod memory;
pub mod retrieval;

pub use error::Result;

// Re-export common types
pub use config::ChatbotConfig;
pub use conversational::{ConversationOrchestrator, ConversationSettings, TurnReply};
pub use error::ChatbotError;
pub use memory::{Message, MessageRole, Transcript};
