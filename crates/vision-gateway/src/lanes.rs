use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use tokio::sync::{Mutex, OwnedMutexGuard};

use vision_types::models::ChatId;

type Lane = Arc<Mutex<()>>;

/// One FIFO lock per chat. Whatever is persisted and broadcast under a
/// chat's lane reaches clients in the order the lane was taken. Entries
/// exist only while someone holds or waits on them.
#[derive(Default)]
pub struct ChatLanes {
    lanes: StdMutex<HashMap<ChatId, Lane>>,
}

impl ChatLanes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for `chat_id`'s lane. The lane is released when the guard drops.
    pub async fn acquire(self: &Arc<Self>, chat_id: ChatId) -> LaneGuard {
        let lane = self.map().entry(chat_id).or_default().clone();
        let guard = lane.lock_owned().await;
        LaneGuard {
            chat_id,
            guard: Some(guard),
            lanes: self.clone(),
        }
    }

    /// Number of chats with a held or awaited lane.
    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn map(&self) -> MutexGuard<'_, HashMap<ChatId, Lane>> {
        // The map is only touched in short non-panicking sections.
        self.lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, chat_id: ChatId) {
        let mut map = self.map();
        // Clones are only made under the map lock, so a count of one means
        // nobody else holds or awaits this lane.
        if map.get(&chat_id).is_some_and(|lane| Arc::strong_count(lane) == 1) {
            map.remove(&chat_id);
        }
    }
}

/// Held lane for one chat.
pub struct LaneGuard {
    chat_id: ChatId,
    guard: Option<OwnedMutexGuard<()>>,
    lanes: Arc<ChatLanes>,
}

impl LaneGuard {
    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }
}

impl Drop for LaneGuard {
    fn drop(&mut self) {
        // The owned guard keeps its own Arc; drop it before counting.
        self.guard.take();
        self.lanes.release(self.chat_id);
    }
}
