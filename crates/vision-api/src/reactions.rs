use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use tracing::debug;

use vision_db::messages::ToggleOutcome;
use vision_gateway::Exclude;
use vision_types::api::{Claims, ToggleReactionRequest, ToggleReactionResponse};
use vision_types::events::{ReactionPayload, ServerEvent};
use vision_types::models::MessageId;

use crate::{ApiError, AppState, message_lane, with_db};

const MAX_EMOJI_LEN: usize = 32;

pub async fn toggle_reaction(
    State(state): State<AppState>,
    Path(message_id): Path<MessageId>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ToggleReactionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let emoji = req.emoji.trim().to_string();
    if emoji.is_empty() || emoji.len() > MAX_EMOJI_LEN {
        return Err(ApiError::invalid(format!(
            "emoji must be 1..={} bytes",
            MAX_EMOJI_LEN
        )));
    }

    let user_id = claims.sub;
    let key = emoji.clone();
    let _lane = message_lane(&state, message_id).await?;
    let outcome = with_db(&state, "toggle_reaction", move |db| {
        db.toggle_reaction(message_id, user_id, &key)
    })
    .await?;

    let (chat_id, added) = match outcome {
        ToggleOutcome::Added { chat_id } => (chat_id, true),
        ToggleOutcome::Removed { chat_id } => (chat_id, false),
        ToggleOutcome::MessageNotFound => return Err(ApiError::not_found("message")),
        ToggleOutcome::NotMember => return Err(ApiError::unauthorized()),
    };

    let payload = ReactionPayload {
        chat_id,
        message_id,
        user_id,
        emoji: emoji.clone(),
    };
    let event = if added {
        ServerEvent::ReactionAdded(payload)
    } else {
        ServerEvent::ReactionRemoved(payload)
    };
    let delivered = state.dispatcher.broadcast(event, chat_id, Exclude::Nobody).await;
    debug!(
        "Reaction {} by user {} on message {} ({}), delivered to {} connections",
        emoji,
        user_id,
        message_id,
        if added { "added" } else { "removed" },
        delivered
    );

    Ok(Json(ToggleReactionResponse {
        message_id,
        emoji,
        added,
    }))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::tests::{call, test_app};

    #[tokio::test]
    async fn toggling_adds_removes_and_re_adds() {
        let t = test_app();
        let (_, msg) = call(
            &t.app,
            "POST",
            &format!("/api/chat/{}/messages", t.chat),
            Some(t.alice),
            Some(json!({"content": "vote"})),
        )
        .await;
        let uri = format!("/api/chat/messages/{}/reactions", msg["id"]);
        let thumbs = json!({"emoji": "👍"});

        for expected in [true, false, true] {
            let (status, body) = call(&t.app, "POST", &uri, Some(t.bob), Some(thumbs.clone())).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["added"], expected);
        }

        let (_, page) = call(
            &t.app,
            "GET",
            &format!("/api/chat/{}/messages", t.chat),
            Some(t.alice),
            None,
        )
        .await;
        assert_eq!(page[0]["reactions"][0]["emoji"], "👍");
        assert_eq!(page[0]["reactions"][0]["count"], 1);
        assert_eq!(page[0]["reactions"][0]["userIds"], json!([t.bob]));
    }

    #[tokio::test]
    async fn outsiders_and_missing_messages_are_rejected() {
        let t = test_app();
        let (_, msg) = call(
            &t.app,
            "POST",
            &format!("/api/chat/{}/messages", t.chat),
            Some(t.alice),
            Some(json!({"content": "hi"})),
        )
        .await;

        let (status, _) = call(
            &t.app,
            "POST",
            &format!("/api/chat/messages/{}/reactions", msg["id"]),
            Some(t.carol),
            Some(json!({"emoji": "👀"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(
            &t.app,
            "POST",
            "/api/chat/messages/9999/reactions",
            Some(t.alice),
            Some(json!({"emoji": "👀"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &t.app,
            "POST",
            &format!("/api/chat/messages/{}/reactions", msg["id"]),
            Some(t.alice),
            Some(json!({"emoji": "  "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
