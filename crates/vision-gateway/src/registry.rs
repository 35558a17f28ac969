use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

use vision_types::AuthError;
use vision_types::api::Claims;
use vision_types::events::ServerEvent;
use vision_types::models::UserId;

use crate::auth::TokenVerifier;

pub type SessionId = Uuid;

/// Per-connection queue drained by the connection's send loop.
pub type Outbox = mpsc::UnboundedSender<ServerEvent>;

/// Which recipients a fan-out skips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclude {
    Nobody,
    Connection(SessionId),
    User(UserId),
}

impl Exclude {
    fn skips(&self, session_id: SessionId, user_id: UserId) -> bool {
        match *self {
            Self::Nobody => false,
            Self::Connection(id) => id == session_id,
            Self::User(id) => id == user_id,
        }
    }
}

struct Session {
    outbox: Outbox,
    user_id: Option<UserId>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, Session>,
    by_user: HashMap<UserId, HashSet<SessionId>>,
    closed: bool,
}

/// Live connections, pending and authenticated. Removing a session drops
/// its outbox sender, which ends the connection's send loop.
pub struct SessionRegistry {
    verifier: Arc<dyn TokenVerifier>,
    state: RwLock<RegistryState>,
}

impl SessionRegistry {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            verifier,
            state: RwLock::new(RegistryState::default()),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        self.verifier.verify(token)
    }

    /// Track a new, unauthenticated connection. None after shutdown.
    pub async fn open(&self, outbox: Outbox) -> Option<SessionId> {
        let mut state = self.state.write().await;
        if state.closed {
            return None;
        }
        let session_id = Uuid::new_v4();
        state.sessions.insert(
            session_id,
            Session {
                outbox,
                user_id: None,
            },
        );
        debug!("Session {} opened ({} live)", session_id, state.sessions.len());
        Some(session_id)
    }

    /// Bind a pending connection to `user_id` once its token checks out.
    /// Re-authenticating as the same user is a no-op.
    pub async fn register(
        &self,
        session_id: SessionId,
        user_id: UserId,
        token: &str,
    ) -> Result<(), AuthError> {
        let claims = self.verifier.verify(token)?;
        if claims.sub != user_id {
            return Err(AuthError::UserMismatch(user_id));
        }

        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let session = state
            .sessions
            .get_mut(&session_id)
            .ok_or(AuthError::ConnectionClosed)?;
        match session.user_id {
            Some(existing) if existing == user_id => return Ok(()),
            Some(_) => return Err(AuthError::UserMismatch(user_id)),
            None => session.user_id = Some(user_id),
        }

        state.by_user.entry(user_id).or_default().insert(session_id);
        Ok(())
    }

    /// Forget a connection. Returns the user and how many of their
    /// connections remain, or None for pending/unknown sessions.
    pub async fn unregister(&self, session_id: SessionId) -> Option<(UserId, usize)> {
        let mut state = self.state.write().await;
        let session = state.sessions.remove(&session_id)?;
        let user_id = session.user_id?;
        let remaining = match state.by_user.get_mut(&user_id) {
            Some(sessions) => {
                sessions.remove(&session_id);
                sessions.len()
            }
            None => 0,
        };
        if remaining == 0 {
            state.by_user.remove(&user_id);
        }
        Some((user_id, remaining))
    }

    /// Send a final event and drop the session, but only if it never
    /// authenticated. Returns false if it was authenticated or gone.
    pub async fn close_pending(&self, session_id: SessionId, farewell: ServerEvent) -> bool {
        let mut state = self.state.write().await;
        match state.sessions.get(&session_id) {
            Some(session) if session.user_id.is_none() => {
                let _ = session.outbox.send(farewell);
            }
            _ => return false,
        }
        state.sessions.remove(&session_id);
        true
    }

    pub async fn user_of(&self, session_id: SessionId) -> Option<UserId> {
        self.state
            .read()
            .await
            .sessions
            .get(&session_id)
            .and_then(|s| s.user_id)
    }

    pub async fn is_pending(&self, session_id: SessionId) -> bool {
        self.state
            .read()
            .await
            .sessions
            .get(&session_id)
            .is_some_and(|s| s.user_id.is_none())
    }

    pub async fn connections_for(&self, user_id: UserId) -> Vec<SessionId> {
        self.state
            .read()
            .await
            .by_user
            .get(&user_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn has_connections(&self, user_id: UserId) -> bool {
        self.state.read().await.by_user.contains_key(&user_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    /// Queue an event for one connection. False if it is gone.
    pub async fn send(&self, session_id: SessionId, event: ServerEvent) -> bool {
        let state = self.state.read().await;
        match state.sessions.get(&session_id) {
            Some(session) => session.outbox.send(event).is_ok(),
            None => false,
        }
    }

    /// Queue an event for every connection of every listed user.
    /// Returns the number of connections reached.
    pub async fn deliver(&self, users: &[UserId], event: &ServerEvent, exclude: Exclude) -> usize {
        let state = self.state.read().await;
        let mut delivered = 0;
        for &user_id in users {
            let Some(sessions) = state.by_user.get(&user_id) else {
                continue;
            };
            for &session_id in sessions {
                if exclude.skips(session_id, user_id) {
                    continue;
                }
                if let Some(session) = state.sessions.get(&session_id) {
                    if session.outbox.send(event.clone()).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }
        delivered
    }

    /// Drop every connection and refuse new ones.
    pub async fn shutdown(&self) -> usize {
        let mut state = self.state.write().await;
        state.closed = true;
        let count = state.sessions.len();
        state.sessions.clear();
        state.by_user.clear();
        info!("Session registry shut down, closed {} connections", count);
        count
    }
}
