//! Per-session write serialization
//!
//! A turn holds its session's guard across load, mutate and save, so two
//! concurrent turns on one session can never overwrite each other's result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

/// Idle lock entries are pruned once the map grows past this size.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `session_id`.
    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            if locks.len() > PRUNE_THRESHOLD {
                // Only the map holds a reference to idle entries.
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }

            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        lock.lock_owned().await
    }

    pub fn tracked_sessions(&self) -> usize {
        self.locks
            .lock()
            .map(|locks| locks.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_session_is_exclusive() {
        let locks = SessionLocks::new();
        let guard = locks.acquire("s1").await;

        let second = tokio::time::timeout(Duration::from_millis(50), locks.acquire("s1")).await;
        assert!(second.is_err(), "second acquire should block while the first guard lives");

        drop(guard);
        let third = tokio::time::timeout(Duration::from_millis(50), locks.acquire("s1")).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn test_different_sessions_do_not_block() {
        let locks = SessionLocks::new();
        let _a = locks.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.acquire("b")).await;
        assert!(b.is_ok());
        assert_eq!(locks.tracked_sessions(), 2);
    }

    #[tokio::test]
    async fn test_idle_entries_are_pruned() {
        let locks = SessionLocks::new();
        for i in 0..=PRUNE_THRESHOLD {
            let _guard = locks.acquire(&format!("s{}", i)).await;
        }
        let _held = locks.acquire("fresh").await;
        assert_eq!(locks.tracked_sessions(), 1);
    }
}
