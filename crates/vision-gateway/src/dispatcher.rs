use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vision_db::Database;
use vision_db::models::ReadOutcome;
use vision_types::api::Claims;
use vision_types::events::{
    AuthFailure, AuthPayload, AuthSuccess, ChatRef, ClientEvent, ReadReceipt, ServerEvent,
    StatusPayload, TypingPayload,
};
use vision_types::models::{Chat, ChatId, UserId, UserStatus, ms_to_datetime};
use vision_types::{AuthError, ChatError};

use crate::auth::TokenVerifier;
use crate::config::GatewayConfig;
use crate::lanes::{ChatLanes, LaneGuard};
use crate::persistence::Persistence;
use crate::presence::PresenceTracker;
pub use crate::registry::Exclude;
use crate::registry::{SessionId, SessionRegistry};
use crate::rooms::RoomIndex;
use crate::typing::TypingTracker;

/// Routes client events and fans server events out to connections.
#[derive(Clone)]
pub struct Dispatcher {
    pub(crate) inner: Arc<DispatcherInner>,
}

pub(crate) struct DispatcherInner {
    pub(crate) config: GatewayConfig,
    pub(crate) store: Persistence,
    pub(crate) registry: SessionRegistry,
    pub(crate) rooms: RoomIndex,
    pub(crate) presence: PresenceTracker,
    pub(crate) typing: TypingTracker,
    /// Per-chat ordered lanes: persist and publish happen under the lane.
    lanes: Arc<ChatLanes>,
    /// Serialises connect, disconnect, offline expiry and membership
    /// changes so registry, presence and room index move together.
    lifecycle: Mutex<()>,
}

impl Dispatcher {
    pub fn new(db: Arc<Database>, verifier: Arc<dyn TokenVerifier>, config: GatewayConfig) -> Self {
        let store = Persistence::new(db, config.persist_timeout, config.persist_backoff);
        Self {
            inner: Arc::new(DispatcherInner {
                config,
                store,
                registry: SessionRegistry::new(verifier),
                rooms: RoomIndex::new(),
                presence: PresenceTracker::new(),
                typing: TypingTracker::new(),
                lanes: Arc::new(ChatLanes::new()),
                lifecycle: Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn db(&self) -> &Arc<Database> {
        self.inner.store.db()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn rooms(&self) -> &RoomIndex {
        &self.inner.rooms
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.inner.presence
    }

    pub fn lanes(&self) -> &ChatLanes {
        &self.inner.lanes
    }

    /// Wait for `chat_id`'s lane. Events broadcast while holding it are
    /// ordered after every message ingested before it was taken.
    pub async fn lane(&self, chat_id: ChatId) -> LaneGuard {
        self.inner.lanes.acquire(chat_id).await
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims, AuthError> {
        self.inner.registry.verify(token)
    }

    // -- Connection lifecycle --

    /// Open a pending connection. The returned receiver is the connection's
    /// outbox; it closes when the session is dropped. None after shutdown.
    pub async fn connect(&self) -> Option<(SessionId, mpsc::UnboundedReceiver<ServerEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = self.inner.registry.open(tx).await?;

        let this = self.clone();
        let deadline = self.inner.config.auth_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let farewell = ServerEvent::AuthError(AuthFailure {
                message: AuthError::Timeout.to_string(),
            });
            if this.inner.registry.close_pending(session_id, farewell).await {
                warn!("Session {} did not authenticate within {:?}, closed", session_id, deadline);
            }
        });

        Some((session_id, rx))
    }

    /// Bookkeeping for a closed connection. Safe to call more than once.
    pub async fn disconnect(&self, session_id: SessionId) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let Some((user_id, remaining)) = self.inner.registry.unregister(session_id).await else {
            return;
        };
        info!(
            "User {} disconnected session {} ({} remaining)",
            user_id, session_id, remaining
        );

        let Some(generation) = self.inner.presence.disconnect(user_id).await else {
            return;
        };

        let this = self.clone();
        let grace = self.inner.config.presence_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            this.expire_presence(user_id, generation).await;
        });
    }

    async fn expire_presence(&self, user_id: UserId, generation: u64) {
        let (peers, typing) = {
            let _lifecycle = self.inner.lifecycle.lock().await;
            if !self.inner.presence.expire(user_id, generation).await {
                return;
            }
            let peers = self.inner.rooms.co_members(user_id).await;
            self.inner.rooms.drop_user(user_id).await;
            (peers, self.inner.typing.clear_user(user_id).await)
        };

        for chat_id in typing {
            self.broadcast(
                ServerEvent::TypingStop(TypingPayload { chat_id, user_id }),
                chat_id,
                Exclude::User(user_id),
            )
            .await;
        }
        self.announce_status(&peers, user_id, UserStatus::Offline).await;
        info!("User {} is offline", user_id);
    }

    // -- Inbound events --

    /// Parse and handle one text frame.
    pub async fn handle_text(&self, session_id: SessionId, text: &str) {
        match ClientEvent::parse(text) {
            Ok(event) => self.handle(session_id, event).await,
            Err(err) => {
                let preview: String = text.chars().take(200).collect();
                warn!("Session {} sent a bad event: {} -- raw: {}", session_id, err, preview);
                let name = serde_json::from_str::<serde_json::Value>(text)
                    .ok()
                    .and_then(|v| v.get("type")?.as_str().map(str::to_owned))
                    .unwrap_or_else(|| "unknown".to_owned());
                self.send_error(session_id, &name, &err, None).await;
            }
        }
    }

    pub async fn handle(&self, session_id: SessionId, event: ClientEvent) {
        let name = event.name();
        let event = match event {
            ClientEvent::Auth(payload) => return self.authenticate(session_id, payload).await,
            other => other,
        };

        let Some(user_id) = self.inner.registry.user_of(session_id).await else {
            debug!("Dropping {} on unauthenticated session {}", name, session_id);
            self.send_error(session_id, name, &ChatError::Unauthenticated, None)
                .await;
            return;
        };

        let result = match event {
            ClientEvent::Message(payload) => {
                self.submit_message(session_id, user_id, payload).await;
                Ok(())
            }
            ClientEvent::TypingStart(ChatRef { chat_id }) => self.typing_start(user_id, chat_id).await,
            ClientEvent::TypingStop(ChatRef { chat_id }) => self.typing_stop(user_id, chat_id).await,
            ClientEvent::MarkRead(read) => {
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = this.mark_read(user_id, read.chat_id, read.timestamp).await {
                        this.send_error(session_id, "mark_read", &err, None).await;
                    }
                });
                Ok(())
            }
            ClientEvent::UserStatus(update) => self.set_status(user_id, update.status).await,
            ClientEvent::Heartbeat => {
                self.heartbeat(user_id).await;
                Ok(())
            }
            ClientEvent::Auth(_) => Ok(()),
        };

        if let Err(err) = result {
            debug!("{} from user {} failed: {}", name, user_id, err);
            self.send_error(session_id, name, &err, None).await;
        }
    }

    async fn authenticate(&self, session_id: SessionId, payload: AuthPayload) {
        let user_id = payload.user_id;

        if let Some(current) = self.inner.registry.user_of(session_id).await {
            let event = match self.inner.registry.verify(&payload.token) {
                Ok(claims) if claims.sub == user_id && current == user_id => {
                    ServerEvent::AuthSuccess(AuthSuccess { user_id, session_id })
                }
                Ok(_) => auth_failure(AuthError::UserMismatch(user_id)),
                Err(err) => auth_failure(err),
            };
            self.inner.registry.send(session_id, event).await;
            return;
        }

        if let Err(err) = self.admit(session_id, &payload).await {
            warn!("Session {} failed auth as user {}: {}", session_id, user_id, err);
            self.inner
                .registry
                .close_pending(session_id, auth_failure(err))
                .await;
        }
    }

    async fn admit(&self, session_id: SessionId, payload: &AuthPayload) -> Result<(), AuthError> {
        let user_id = payload.user_id;
        let claims = self.inner.registry.verify(&payload.token)?;
        if claims.sub != user_id {
            return Err(AuthError::UserMismatch(user_id));
        }

        let came_online = {
            // Membership is read under the lifecycle lock: a REST membership
            // change either lands before the read or waits for the load.
            let _lifecycle = self.inner.lifecycle.lock().await;
            let chats = self
                .inner
                .store
                .run("load_rooms", move |db| {
                    if db.get_user(user_id)?.is_none() {
                        return Ok(None);
                    }
                    db.chat_ids_for_user(user_id).map(Some)
                })
                .await
                .map_err(|_| AuthError::StorageUnavailable)?
                .ok_or(AuthError::UnknownUser(user_id))?;
            self.inner
                .registry
                .register(session_id, user_id, &payload.token)
                .await?;
            self.inner.rooms.load_user(user_id, chats).await;
            self.inner.presence.connect(user_id).await.is_some()
        };

        self.inner
            .registry
            .send(session_id, ServerEvent::AuthSuccess(AuthSuccess { user_id, session_id }))
            .await;
        info!("User {} authenticated on session {}", user_id, session_id);

        let peers = self.inner.rooms.co_members(user_id).await;
        if came_online {
            self.announce_status(&peers, user_id, UserStatus::Online).await;
        }

        // Bring the new connection up to date on who is around.
        for peer in peers {
            let status = self.inner.presence.status_of(peer).await;
            if status != UserStatus::Offline {
                self.inner
                    .registry
                    .send(
                        session_id,
                        ServerEvent::UserStatus(StatusPayload { user_id: peer, status }),
                    )
                    .await;
            }
        }
        Ok(())
    }

    async fn typing_start(&self, user_id: UserId, chat_id: ChatId) -> Result<(), ChatError> {
        if !self.inner.rooms.is_member(chat_id, user_id).await {
            return Err(ChatError::Unauthorized);
        }
        let (started, generation) = self.inner.typing.start(chat_id, user_id).await;
        let payload = TypingPayload { chat_id, user_id };
        if started {
            self.broadcast(ServerEvent::TypingStart(payload), chat_id, Exclude::User(user_id))
                .await;
        }

        let this = self.clone();
        let ttl = self.inner.config.typing_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if this.inner.typing.expire(chat_id, user_id, generation).await {
                this.broadcast(ServerEvent::TypingStop(payload), chat_id, Exclude::User(user_id))
                    .await;
            }
        });
        Ok(())
    }

    async fn typing_stop(&self, user_id: UserId, chat_id: ChatId) -> Result<(), ChatError> {
        if !self.inner.rooms.is_member(chat_id, user_id).await {
            return Err(ChatError::Unauthorized);
        }
        if self.inner.typing.stop(chat_id, user_id).await {
            self.broadcast(
                ServerEvent::TypingStop(TypingPayload { chat_id, user_id }),
                chat_id,
                Exclude::User(user_id),
            )
            .await;
        }
        Ok(())
    }

    /// Advance a read watermark and tell the other participants. The
    /// watermark defaults to now and is never taken from the future.
    pub async fn mark_read(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        at: Option<chrono::DateTime<Utc>>,
    ) -> Result<ReadOutcome, ChatError> {
        let now = Utc::now().timestamp_millis();
        let ts = at.map_or(now, |t| t.timestamp_millis().min(now));
        let outcome = self
            .inner
            .store
            .run("mark_read", move |db| db.advance_last_read(chat_id, user_id, ts))
            .await?
            .ok_or(ChatError::Unauthorized)?;

        if outcome.advanced {
            self.broadcast(
                ServerEvent::MessageRead(ReadReceipt {
                    chat_id,
                    user_id,
                    timestamp: ms_to_datetime(outcome.watermark),
                }),
                chat_id,
                Exclude::User(user_id),
            )
            .await;
        }
        Ok(outcome)
    }

    async fn set_status(&self, user_id: UserId, status: UserStatus) -> Result<(), ChatError> {
        if status == UserStatus::Offline {
            return Err(ChatError::InvalidPayload(
                "offline is set by disconnecting".into(),
            ));
        }
        if let Some(status) = self.inner.presence.set_status(user_id, status).await {
            let peers = self.inner.rooms.co_members(user_id).await;
            self.announce_status(&peers, user_id, status).await;
        }
        Ok(())
    }

    async fn heartbeat(&self, user_id: UserId) {
        if let Some(status) = self.inner.presence.heartbeat(user_id).await {
            let peers = self.inner.rooms.co_members(user_id).await;
            self.announce_status(&peers, user_id, status).await;
        }
    }

    /// Mark idle users away and tell their co-members.
    pub async fn sweep_idle(&self) -> usize {
        let idled = self
            .inner
            .presence
            .sweep_idle(self.inner.config.idle_timeout)
            .await;
        for &user_id in &idled {
            let peers = self.inner.rooms.co_members(user_id).await;
            self.announce_status(&peers, user_id, UserStatus::Away).await;
        }
        idled.len()
    }

    pub fn spawn_idle_sweep(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.inner.config.idle_sweep_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                let idled = this.sweep_idle().await;
                if idled > 0 {
                    debug!("Idle sweep marked {} users away", idled);
                }
            }
        })
    }

    // -- Fan-out --

    /// Queue `event` for every connection of every indexed member of `chat_id`.
    /// Returns the number of connections reached.
    pub async fn broadcast(&self, event: ServerEvent, chat_id: ChatId, exclude: Exclude) -> usize {
        debug_assert!(event.chat_id().is_none_or(|id| id == chat_id));
        let members = self.inner.rooms.members_of(chat_id).await;
        self.inner.registry.deliver(&members, &event, exclude).await
    }

    pub async fn send_to_user(&self, user_id: UserId, event: ServerEvent) -> usize {
        self.inner
            .registry
            .deliver(&[user_id], &event, Exclude::Nobody)
            .await
    }

    pub(crate) async fn send_error(
        &self,
        session_id: SessionId,
        event: &str,
        err: &ChatError,
        client_id: Option<String>,
    ) {
        self.inner
            .registry
            .send(session_id, ServerEvent::error(event, err, client_id))
            .await;
    }

    async fn announce_status(&self, peers: &[UserId], user_id: UserId, status: UserStatus) {
        let event = ServerEvent::UserStatus(StatusPayload { user_id, status });
        self.inner
            .registry
            .deliver(peers, &event, Exclude::Nobody)
            .await;

        let result = self
            .inner
            .store
            .run("set_user_status", move |db| db.set_user_status(user_id, status.as_str()))
            .await;
        if let Err(err) = result {
            warn!("Could not persist status {} for user {}: {}", status, user_id, err);
        }
    }

    // -- Membership changes from the REST surface --
    //
    // Callers commit the change to storage first. The hooks take the
    // lifecycle lock, so a login that read membership before the commit
    // has finished loading its rooms by the time the hook applies.

    /// Index connected members of a new chat and push it to them.
    pub async fn chat_created(&self, chat: Chat, member_ids: &[UserId]) {
        {
            let _lifecycle = self.inner.lifecycle.lock().await;
            for &user_id in member_ids {
                self.inner.rooms.join(chat.id, user_id).await;
            }
        }
        self.inner
            .registry
            .deliver(member_ids, &ServerEvent::ChatNew(chat), Exclude::Nobody)
            .await;
    }

    pub async fn participant_added(&self, chat: Chat, user_id: UserId) {
        {
            let _lifecycle = self.inner.lifecycle.lock().await;
            self.inner.rooms.join(chat.id, user_id).await;
        }
        self.send_to_user(user_id, ServerEvent::ChatNew(chat)).await;
    }

    pub async fn participant_removed(&self, chat_id: ChatId, user_id: UserId) {
        {
            let _lifecycle = self.inner.lifecycle.lock().await;
            self.inner.rooms.leave(chat_id, user_id).await;
        }
        if self.inner.typing.stop(chat_id, user_id).await {
            self.broadcast(
                ServerEvent::TypingStop(TypingPayload { chat_id, user_id }),
                chat_id,
                Exclude::User(user_id),
            )
            .await;
        }
        self.send_to_user(user_id, ServerEvent::ChatRemoved(ChatRef { chat_id }))
            .await;
    }

    // -- Shutdown --

    /// Close every connection and record everyone offline.
    pub async fn shutdown(&self) {
        let closed = self.inner.registry.shutdown().await;
        let users = self.inner.presence.clear().await;
        let count = users.len();
        let result = self
            .inner
            .store
            .run("mark_all_offline", move |db| {
                for &user_id in &users {
                    db.set_user_status(user_id, UserStatus::Offline.as_str())?;
                }
                Ok(())
            })
            .await;
        if let Err(err) = result {
            warn!("Could not persist offline status on shutdown: {}", err);
        }
        info!(
            "Dispatcher shut down ({} connections, {} users)",
            closed, count
        );
    }
}

fn auth_failure(err: AuthError) -> ServerEvent {
    ServerEvent::AuthError(AuthFailure {
        message: err.to_string(),
    })
}
