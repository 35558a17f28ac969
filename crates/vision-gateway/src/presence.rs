use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use vision_types::models::{UserId, UserStatus};

struct Entry {
    status: UserStatus,
    connections: usize,
    /// Bumped on every connect so a pending grace expiry can tell it is stale.
    generation: u64,
    last_active: Instant,
    /// Set when the user chose their status; idle handling leaves it alone.
    explicit: bool,
}

/// Per-user presence: `offline → online → away → offline`.
/// Users without an entry are offline.
#[derive(Default)]
pub struct PresenceTracker {
    users: Mutex<HashMap<UserId, Entry>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new connection. Returns `Online` when the user just came online.
    pub async fn connect(&self, user_id: UserId) -> Option<UserStatus> {
        let mut users = self.users.lock().await;
        let now = Instant::now();
        match users.get_mut(&user_id) {
            Some(entry) => {
                entry.connections += 1;
                entry.generation += 1;
                entry.last_active = now;
                None
            }
            None => {
                users.insert(
                    user_id,
                    Entry {
                        status: UserStatus::Online,
                        connections: 1,
                        generation: 0,
                        last_active: now,
                        explicit: false,
                    },
                );
                Some(UserStatus::Online)
            }
        }
    }

    /// Count a closed connection. When it was the last one, returns the
    /// generation to pass to [`expire`](Self::expire) after the grace period.
    pub async fn disconnect(&self, user_id: UserId) -> Option<u64> {
        let mut users = self.users.lock().await;
        let entry = users.get_mut(&user_id)?;
        entry.connections = entry.connections.saturating_sub(1);
        (entry.connections == 0).then_some(entry.generation)
    }

    /// End the grace period. True if the user is now offline; false if they
    /// reconnected in the meantime.
    pub async fn expire(&self, user_id: UserId, generation: u64) -> bool {
        let mut users = self.users.lock().await;
        let stale = users
            .get(&user_id)
            .is_some_and(|e| e.connections == 0 && e.generation == generation);
        if stale {
            users.remove(&user_id);
        }
        stale
    }

    /// Record client activity. Returns `Online` when this brings an idle
    /// user back from `away`.
    pub async fn heartbeat(&self, user_id: UserId) -> Option<UserStatus> {
        let mut users = self.users.lock().await;
        let entry = users.get_mut(&user_id)?;
        entry.last_active = Instant::now();
        if entry.status == UserStatus::Away && !entry.explicit {
            entry.status = UserStatus::Online;
            return Some(UserStatus::Online);
        }
        None
    }

    /// Apply a client-chosen status. Returns it if it changed anything.
    pub async fn set_status(&self, user_id: UserId, status: UserStatus) -> Option<UserStatus> {
        let mut users = self.users.lock().await;
        let entry = users.get_mut(&user_id)?;
        entry.last_active = Instant::now();
        entry.explicit = status != UserStatus::Online;
        if entry.status == status {
            return None;
        }
        entry.status = status;
        Some(status)
    }

    /// Move users idle for at least `idle_timeout` from online to away.
    pub async fn sweep_idle(&self, idle_timeout: Duration) -> Vec<UserId> {
        let mut users = self.users.lock().await;
        let now = Instant::now();
        let mut idled = Vec::new();
        for (&user_id, entry) in users.iter_mut() {
            if entry.status == UserStatus::Online
                && entry.connections > 0
                && now.duration_since(entry.last_active) >= idle_timeout
            {
                entry.status = UserStatus::Away;
                entry.explicit = false;
                idled.push(user_id);
            }
        }
        idled
    }

    pub async fn status_of(&self, user_id: UserId) -> UserStatus {
        self.users
            .lock()
            .await
            .get(&user_id)
            .map_or(UserStatus::Offline, |e| e.status)
    }

    pub async fn clear(&self) -> Vec<UserId> {
        self.users.lock().await.drain().map(|(id, _)| id).collect()
    }
}
