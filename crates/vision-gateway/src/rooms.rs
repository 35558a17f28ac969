use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;
use tracing::trace;

use vision_types::models::{ChatId, UserId};

#[derive(Default)]
struct RoomState {
    by_user: HashMap<UserId, HashSet<ChatId>>,
    by_chat: HashMap<ChatId, HashSet<UserId>>,
}

/// Chat membership of connected users only. Both directions are kept in
/// step under one lock.
#[derive(Default)]
pub struct RoomIndex {
    state: RwLock<RoomState>,
}

impl RoomIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a user's rooms with a fresh load from storage.
    pub async fn load_user(&self, user_id: UserId, chats: impl IntoIterator<Item = ChatId>) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        remove_user(state, user_id);
        let chats: HashSet<ChatId> = chats.into_iter().collect();
        for &chat_id in &chats {
            state.by_chat.entry(chat_id).or_default().insert(user_id);
        }
        trace!("Room index loaded {} chats for user {}", chats.len(), user_id);
        state.by_user.insert(user_id, chats);
    }

    /// Add a membership. Ignored unless the user is loaded (connected).
    pub async fn join(&self, chat_id: ChatId, user_id: UserId) -> bool {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let Some(rooms) = state.by_user.get_mut(&user_id) else {
            return false;
        };
        rooms.insert(chat_id);
        state.by_chat.entry(chat_id).or_default().insert(user_id);
        true
    }

    pub async fn leave(&self, chat_id: ChatId, user_id: UserId) -> bool {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let removed = state
            .by_user
            .get_mut(&user_id)
            .is_some_and(|rooms| rooms.remove(&chat_id));
        if let Some(members) = state.by_chat.get_mut(&chat_id) {
            members.remove(&user_id);
            if members.is_empty() {
                state.by_chat.remove(&chat_id);
            }
        }
        removed
    }

    pub async fn drop_user(&self, user_id: UserId) {
        let mut state = self.state.write().await;
        remove_user(&mut state, user_id);
    }

    pub async fn is_loaded(&self, user_id: UserId) -> bool {
        self.state.read().await.by_user.contains_key(&user_id)
    }

    pub async fn rooms_for(&self, user_id: UserId) -> HashSet<ChatId> {
        self.state
            .read()
            .await
            .by_user
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn members_of(&self, chat_id: ChatId) -> Vec<UserId> {
        self.state
            .read()
            .await
            .by_chat
            .get(&chat_id)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn is_member(&self, chat_id: ChatId, user_id: UserId) -> bool {
        self.state
            .read()
            .await
            .by_chat
            .get(&chat_id)
            .is_some_and(|m| m.contains(&user_id))
    }

    /// Connected users sharing at least one chat with `user_id`, excluding them.
    pub async fn co_members(&self, user_id: UserId) -> Vec<UserId> {
        let state = self.state.read().await;
        let mut out = HashSet::new();
        if let Some(rooms) = state.by_user.get(&user_id) {
            for chat_id in rooms {
                if let Some(members) = state.by_chat.get(chat_id) {
                    out.extend(members.iter().copied().filter(|&m| m != user_id));
                }
            }
        }
        out.into_iter().collect()
    }
}

fn remove_user(state: &mut RoomState, user_id: UserId) {
    let Some(rooms) = state.by_user.remove(&user_id) else {
        return;
    };
    for chat_id in rooms {
        if let Some(members) = state.by_chat.get_mut(&chat_id) {
            members.remove(&user_id);
            if members.is_empty() {
                state.by_chat.remove(&chat_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_join_leave_drop() {
        let rooms = RoomIndex::new();
        rooms.load_user(1, [10, 11]).await;
        rooms.load_user(2, [10]).await;

        let mut members = rooms.members_of(10).await;
        members.sort();
        assert_eq!(members, vec![1, 2]);
        assert_eq!(rooms.co_members(2).await, vec![1]);

        assert!(rooms.join(11, 2).await);
        assert!(!rooms.join(11, 3).await, "unloaded users are not indexed");
        assert!(rooms.is_member(11, 2).await);

        assert!(rooms.leave(10, 1).await);
        assert!(!rooms.is_member(10, 1).await);
        assert!(!rooms.leave(10, 1).await);

        rooms.drop_user(2).await;
        assert!(rooms.members_of(10).await.is_empty());
        assert_eq!(rooms.members_of(11).await, vec![1]);
        assert!(!rooms.is_loaded(2).await);
    }

    #[tokio::test]
    async fn reload_replaces_previous_rooms() {
        let rooms = RoomIndex::new();
        rooms.load_user(1, [10, 11]).await;
        rooms.load_user(1, [12]).await;
        assert!(rooms.members_of(10).await.is_empty());
        assert_eq!(rooms.rooms_for(1).await, HashSet::from([12]));
    }
}
