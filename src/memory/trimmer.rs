//! Transcript trimming
//!
//! Bounds the history sent to the completion provider: keeps a leading
//! system message, then the most recent messages that fit the token budget,
//! starting the retained window on a user turn.

use crate::memory::store::{Message, MessageRole};
use tracing::debug;

/// Trims transcripts to a fixed token budget
#[derive(Debug, Clone, Copy)]
pub struct TranscriptTrimmer {
    token_budget: usize,
}

impl TranscriptTrimmer {
    pub fn new(token_budget: usize) -> Self {
        Self { token_budget }
    }

    pub fn token_budget(&self) -> usize {
        self.token_budget
    }

    pub fn trim(&self, messages: &[Message]) -> Vec<Message> {
        let trimmed = trim(messages, self.token_budget);

        if trimmed.len() < messages.len() {
            debug!(
                kept = trimmed.len(),
                dropped = messages.len() - trimmed.len(),
                budget = self.token_budget,
                "Trimmed transcript to token budget"
            );
        }

        trimmed
    }
}

/// Return the bounded view of `messages` for `budget` tokens.
///
/// Never empty for non-empty input: when no user-started window fits, the
/// most recent user message is returned on its own even if it alone is over
/// budget (or the most recent message, if there is no user message at all).
pub fn trim(messages: &[Message], budget: usize) -> Vec<Message> {
    let Some((first, tail)) = messages.split_first() else {
        return Vec::new();
    };

    let (system, rest) = if first.role == MessageRole::System {
        if first.token_count() <= budget {
            (Some(first), tail)
        } else {
            (None, tail)
        }
    } else {
        (None, messages)
    };

    let remaining = budget - system.map_or(0, Message::token_count);

    // Longest suffix of `rest` that fits.
    let mut used = 0;
    let mut start = rest.len();
    for (i, msg) in rest.iter().enumerate().rev() {
        let tokens = msg.token_count();
        if used + tokens > remaining {
            break;
        }
        used += tokens;
        start = i;
    }

    let window_start = rest[start..]
        .iter()
        .position(|m| m.role == MessageRole::User)
        .map(|offset| start + offset);

    let mut out: Vec<Message> = system.cloned().into_iter().collect();

    match window_start {
        Some(s) => out.extend_from_slice(&rest[s..]),
        None => {
            if let Some(u) = rest.iter().rposition(|m| m.role == MessageRole::User) {
                out.push(rest[u].clone());
            } else if out.is_empty() {
                out.extend(messages.last().cloned());
            }
        }
    }

    out
}
