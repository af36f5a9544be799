//! Conversation Memory
//!
//! Transcript types, durable per-session storage, per-session locking and
//! token-budget trimming.

pub mod locks;
pub mod session_store;
pub mod store;
pub mod trimmer;

pub use locks::SessionLocks;
pub use session_store::{FileSessionStore, InMemorySessionStore, SessionStore};
pub use store::{Message, MessageRole, Transcript};
pub use trimmer::TranscriptTrimmer;
