use std::collections::HashMap;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::{debug, info};

use vision_db::messages::MessageMutation;
use vision_db::models::{MessageRow, ReactionRow};
use vision_db::now_ms;
use vision_gateway::Exclude;
use vision_types::api::{Claims, EditMessageRequest, MessageResponse, SendMessageRequest};
use vision_types::events::{MessageDeleted, ServerEvent};
use vision_types::models::{ChatId, MessageCursor, MessageId, ReactionGroup, UserId};

use crate::chats::require_member;
use crate::{ApiError, AppState, message_lane, with_db};

const MAX_PAGE: u32 = 200;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Catch-up: messages strictly after this message id.
    pub after: Option<MessageId>,
    /// Catch-up: messages strictly after this Unix millisecond instant.
    pub since: Option<i64>,
    /// History: messages strictly before this message id.
    pub before: Option<MessageId>,
}

fn default_limit() -> u32 {
    50
}

enum Page {
    After(MessageCursor),
    Before(MessageCursor),
}

/// Catch-up and history. Pages are always returned oldest first, ordered by
/// (timestamp, id) like the socket stream.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let forward = [query.after.is_some(), query.since.is_some()]
        .iter()
        .filter(|set| **set)
        .count();
    if forward > 1 || (forward == 1 && query.before.is_some()) {
        return Err(ApiError::invalid("use one of after, since or before"));
    }
    if query.limit == 0 {
        return Err(ApiError::invalid("limit must be positive"));
    }
    require_member(&state, chat_id, claims.sub).await?;

    let limit = query.limit.min(MAX_PAGE);
    let (rows, reaction_rows) = with_db(&state, "get_messages", move |db| {
        let page = if let Some(after) = query.after {
            match db.message_cursor(chat_id, after)? {
                Some(cursor) => Page::After(cursor),
                None => return Ok(None),
            }
        } else if let Some(since) = query.since {
            Page::After(MessageCursor {
                timestamp: since,
                id: i64::MAX,
            })
        } else if let Some(before) = query.before {
            match db.message_cursor(chat_id, before)? {
                Some(cursor) => Page::Before(cursor),
                None => return Ok(None),
            }
        } else {
            Page::Before(MessageCursor::END)
        };

        let rows = match page {
            Page::After(cursor) => db.messages_after(chat_id, cursor, limit)?,
            Page::Before(cursor) => {
                let mut rows = db.messages_before(chat_id, cursor, limit)?;
                rows.reverse();
                rows
            }
        };
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let reactions = db.reactions_for_messages(&ids)?;
        Ok(Some((rows, reactions)))
    })
    .await?
    .ok_or_else(|| ApiError::not_found("message"))?;

    Ok(Json(with_reactions(rows, &reaction_rows)))
}

/// Attach grouped reactions, keeping the order in which emojis were first used.
fn with_reactions(rows: Vec<MessageRow>, reactions: &[ReactionRow]) -> Vec<MessageResponse> {
    let mut groups: HashMap<i64, Vec<ReactionGroup>> = HashMap::new();
    for r in reactions {
        let per_message = groups.entry(r.message_id).or_default();
        match per_message.iter_mut().find(|g| g.emoji == r.emoji) {
            Some(group) => {
                group.count += 1;
                group.user_ids.push(r.user_id);
            }
            None => per_message.push(ReactionGroup {
                emoji: r.emoji.clone(),
                count: 1,
                user_ids: vec![r.user_id],
            }),
        }
    }

    rows.into_iter()
        .map(|row| {
            let reactions = groups.remove(&row.id).unwrap_or_default();
            MessageResponse {
                message: row.into_model(),
                reactions,
            }
        })
        .collect()
}

/// REST form of the socket `message` event, sharing the same ingest path.
pub async fn send_message(
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ingested = state
        .dispatcher
        .ingest(claims.sub, req.into_event(chat_id))
        .await?;
    let status = if ingested.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(MessageResponse {
            message: ingested.message,
            reactions: vec![],
        }),
    ))
}

fn applied(outcome: MessageMutation) -> Result<MessageRow, ApiError> {
    match outcome {
        MessageMutation::Applied(row) => Ok(row),
        MessageMutation::NotFound => Err(ApiError::not_found("message")),
        MessageMutation::Forbidden => Err(ApiError::unauthorized()),
    }
}

pub async fn edit_message(
    State(state): State<AppState>,
    Path(message_id): Path<MessageId>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<EditMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let max = state.dispatcher.config().max_content_len;
    if req.content.trim().is_empty() {
        return Err(ApiError::invalid("content must not be empty"));
    }
    if req.content.chars().count() > max {
        return Err(ApiError::invalid(format!("content exceeds {} characters", max)));
    }

    let editor: UserId = claims.sub;
    let _lane = message_lane(&state, message_id).await?;
    let row = with_db(&state, "edit_message", move |db| {
        db.edit_message(message_id, editor, &req.content)
    })
    .await
    .and_then(applied)?;

    let message = row.into_model();
    debug!("User {} edited message {}", editor, message_id);
    state
        .dispatcher
        .broadcast(
            ServerEvent::MessageUpdated(message.clone()),
            message.chat_id,
            Exclude::Nobody,
        )
        .await;
    Ok(Json(message))
}

/// Soft delete: the row becomes a tombstone that can be restored for a while.
pub async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<MessageId>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = claims.sub;
    let _lane = message_lane(&state, message_id).await?;
    let row = with_db(&state, "soft_delete_message", move |db| {
        db.soft_delete_message(message_id, actor)
    })
    .await
    .and_then(applied)?;

    let message = row.into_model();
    info!("User {} deleted message {}", actor, message_id);
    state
        .dispatcher
        .broadcast(
            ServerEvent::MessageDeleted(MessageDeleted {
                chat_id: message.chat_id,
                message_id,
                permanent: false,
            }),
            message.chat_id,
            Exclude::Nobody,
        )
        .await;
    Ok(Json(message))
}

pub async fn restore_message(
    State(state): State<AppState>,
    Path(message_id): Path<MessageId>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = claims.sub;
    let window_start = now_ms() - state.restore_window.num_milliseconds();
    let _lane = message_lane(&state, message_id).await?;
    let row = with_db(&state, "restore_message", move |db| {
        db.restore_message(message_id, actor, window_start)
    })
    .await
    .and_then(applied)?;

    let message = row.into_model();
    info!("User {} restored message {}", actor, message_id);
    state
        .dispatcher
        .broadcast(
            ServerEvent::MessageRestored(message.clone()),
            message.chat_id,
            Exclude::Nobody,
        )
        .await;
    Ok(Json(message))
}

pub async fn permanent_delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<MessageId>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = claims.sub;
    let _lane = message_lane(&state, message_id).await?;
    let row = with_db(&state, "permanent_delete_message", move |db| {
        db.permanent_delete_message(message_id, actor)
    })
    .await
    .and_then(applied)?;

    info!("User {} permanently deleted message {}", actor, message_id);
    state
        .dispatcher
        .broadcast(
            ServerEvent::MessageDeleted(MessageDeleted {
                chat_id: row.chat_id,
                message_id,
                permanent: true,
            }),
            row.chat_id,
            Exclude::Nobody,
        )
        .await;
    Ok(StatusCode::NO_CONTENT)
}
