use std::collections::HashMap;

use tokio::sync::Mutex;

use vision_types::models::{ChatId, UserId};

/// Who is typing where. Each `start` stamps a fresh generation; an expiry
/// timer only clears the flag if the generation it captured is still current.
#[derive(Default)]
pub struct TypingTracker {
    state: Mutex<TypingState>,
}

#[derive(Default)]
struct TypingState {
    active: HashMap<(ChatId, UserId), u64>,
    next_generation: u64,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the user as typing. Returns whether this is a transition
    /// (not typing → typing) and the generation for the expiry timer.
    pub async fn start(&self, chat_id: ChatId, user_id: UserId) -> (bool, u64) {
        let mut state = self.state.lock().await;
        state.next_generation += 1;
        let generation = state.next_generation;
        let started = state.active.insert((chat_id, user_id), generation).is_none();
        (started, generation)
    }

    /// Returns true if the user was typing.
    pub async fn stop(&self, chat_id: ChatId, user_id: UserId) -> bool {
        self.state
            .lock()
            .await
            .active
            .remove(&(chat_id, user_id))
            .is_some()
    }

    /// Clear the flag if no `start` happened since `generation` was issued.
    pub async fn expire(&self, chat_id: ChatId, user_id: UserId, generation: u64) -> bool {
        let mut state = self.state.lock().await;
        if state.active.get(&(chat_id, user_id)) == Some(&generation) {
            state.active.remove(&(chat_id, user_id));
            return true;
        }
        false
    }

    /// Drop every indicator of a user. Returns the chats they were typing in.
    pub async fn clear_user(&self, user_id: UserId) -> Vec<ChatId> {
        let mut state = self.state.lock().await;
        let chats: Vec<ChatId> = state
            .active
            .keys()
            .filter(|(_, u)| *u == user_id)
            .map(|(c, _)| *c)
            .collect();
        for chat_id in &chats {
            state.active.remove(&(*chat_id, user_id));
        }
        chats
    }

    pub async fn is_typing(&self, chat_id: ChatId, user_id: UserId) -> bool {
        self.state.lock().await.active.contains_key(&(chat_id, user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_transitions_are_reported() {
        let t = TypingTracker::new();
        let (started, _) = t.start(1, 9).await;
        assert!(started);
        let (started, _) = t.start(1, 9).await;
        assert!(!started);
        assert!(t.stop(1, 9).await);
        assert!(!t.stop(1, 9).await);
    }

    #[tokio::test]
    async fn refresh_invalidates_older_expiry() {
        let t = TypingTracker::new();
        let (_, first) = t.start(1, 9).await;
        let (_, second) = t.start(1, 9).await;
        assert!(!t.expire(1, 9, first).await);
        assert!(t.is_typing(1, 9).await);
        assert!(t.expire(1, 9, second).await);
        assert!(!t.is_typing(1, 9).await);
    }

    #[tokio::test]
    async fn clear_user_spans_chats() {
        let t = TypingTracker::new();
        t.start(1, 9).await;
        t.start(2, 9).await;
        t.start(2, 8).await;
        let mut chats = t.clear_user(9).await;
        chats.sort();
        assert_eq!(chats, vec![1, 2]);
        assert!(t.is_typing(2, 8).await);
    }
}
