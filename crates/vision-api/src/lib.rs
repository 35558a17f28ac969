pub mod chats;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod notifications;
pub mod reactions;

use std::sync::Arc;

use axum::{
    Json, Router,
    routing::{delete, get, patch, post},
};
use tracing::error;

use vision_db::Database;
use vision_gateway::{Dispatcher, LaneGuard};
use vision_types::models::MessageId;

pub use error::ApiError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub dispatcher: Dispatcher,
    /// How long a soft-deleted message can still be restored.
    pub restore_window: chrono::Duration,
}

/// REST routes. Everything under `/api` requires a bearer token.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/chats", get(chats::list_chats).post(chats::create_chat))
        .route(
            "/api/chat/{chat_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route("/api/chat/{chat_id}/read", post(chats::mark_read))
        .route("/api/chat/{chat_id}/archive", patch(chats::set_archived))
        .route("/api/chat/{chat_id}/mute", patch(chats::set_muted))
        .route("/api/chat/{chat_id}/settings", patch(chats::update_settings))
        .route("/api/chat/{chat_id}/participants", post(chats::add_participant))
        .route(
            "/api/chat/{chat_id}/participants/{user_id}",
            delete(chats::remove_participant),
        )
        .route(
            "/api/chat/messages/{message_id}",
            patch(messages::edit_message).delete(messages::delete_message),
        )
        .route(
            "/api/chat/messages/{message_id}/restore",
            post(messages::restore_message),
        )
        .route(
            "/api/chat/messages/{message_id}/permanent-delete",
            post(messages::permanent_delete_message),
        )
        .route(
            "/api/chat/messages/{message_id}/reactions",
            post(reactions::toggle_reaction),
        )
        .route("/api/notifications", get(notifications::list_notifications))
        .route(
            "/api/notifications/{notification_id}/read",
            post(notifications::mark_notification_read),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ))
        .with_state(state);

    Router::new().route("/health", get(health)).merge(protected)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Run a storage call off the async runtime.
pub(crate) async fn with_db<T, F>(state: &AppState, op: &'static str, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
{
    let db = state.dispatcher.db().clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error in {}: {}", op, e);
            ApiError::storage(op)
        })?
        .map_err(|e| {
            error!("{} failed: {:#}", op, e);
            ApiError::storage(op)
        })
}

/// Take the lane of the chat holding `message_id`. A change made and
/// broadcast under it cannot overtake the message's own delivery.
pub(crate) async fn message_lane(state: &AppState, message_id: MessageId) -> Result<LaneGuard, ApiError> {
    let chat_id = with_db(state, "get_message", move |db| {
        Ok(db.get_message(message_id)?.map(|row| row.chat_id))
    })
    .await?
    .ok_or_else(|| ApiError::not_found("message"))?;
    Ok(state.dispatcher.lane(chat_id).await)
}
