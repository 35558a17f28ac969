use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;

use vision_db::queries::ParticipantSettings;
use vision_types::api::{
    AddParticipantRequest, ArchiveRequest, ChatSettingsRequest, ChatSettingsResponse,
    ChatSummary, Claims, CreateChatRequest, MarkReadRequest, MarkReadResponse, MuteRequest,
};
use vision_types::models::{ChatId, ChatType, UserId, ms_to_datetime};

use crate::{ApiError, AppState, with_db};

const MAX_CHAT_NAME_LEN: usize = 100;

/// 404 if the chat does not exist, 403 if `user_id` is not in it.
pub(crate) async fn require_member(
    state: &AppState,
    chat_id: ChatId,
    user_id: UserId,
) -> Result<(), ApiError> {
    let (exists, member) = with_db(state, "check_membership", move |db| {
        Ok((
            db.get_chat(chat_id)?.is_some(),
            db.is_participant(chat_id, user_id)?,
        ))
    })
    .await?;
    match (exists, member) {
        (false, _) => Err(ApiError::not_found("chat")),
        (true, false) => Err(ApiError::unauthorized()),
        (true, true) => Ok(()),
    }
}

pub async fn list_chats(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = claims.sub;
    let rows = with_db(&state, "list_chats", move |db| db.list_chats_for_user(user_id)).await?;

    let chats: Vec<ChatSummary> = rows
        .into_iter()
        .map(|row| ChatSummary {
            chat: row.chat.into_model(),
            participant: row.participant.into_model(),
            member_ids: row.member_ids,
            last_message: row.last_message.map(|m| m.into_model()),
            unread_count: row.unread_count,
        })
        .collect();
    Ok(Json(chats))
}

pub async fn create_chat(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let creator = claims.sub;
    let mut members: Vec<UserId> = req
        .member_ids
        .into_iter()
        .filter(|&id| id != creator)
        .collect();
    members.sort_unstable();
    members.dedup();

    match req.kind {
        ChatType::Individual if members.len() != 1 => {
            return Err(ApiError::invalid("individual chats have exactly one other member"));
        }
        ChatType::Group if members.is_empty() => {
            return Err(ApiError::invalid("group chats need at least one other member"));
        }
        ChatType::Group if req.name.trim().is_empty() => {
            return Err(ApiError::invalid("group chats need a name"));
        }
        _ => {}
    }
    if req.name.chars().count() > MAX_CHAT_NAME_LEN {
        return Err(ApiError::invalid(format!(
            "name exceeds {} characters",
            MAX_CHAT_NAME_LEN
        )));
    }

    let kind = req.kind;
    let name = req.name.trim().to_string();
    let avatar = req.avatar;
    let (chat, member_ids) = with_db(&state, "create_chat", move |db| {
        let Some(chat) = db.create_chat(kind.as_str(), &name, avatar.as_deref(), creator, &members)?
        else {
            return Ok(None);
        };
        let member_ids = db.chat_member_ids(chat.id)?;
        Ok(Some((chat, member_ids)))
    })
    .await?
    .ok_or_else(|| ApiError::invalid("memberIds names an unknown user"))?;

    let chat = chat.into_model();
    info!(
        "User {} created {} chat {} with {} members",
        creator,
        kind.as_str(),
        chat.id,
        member_ids.len()
    );
    state.dispatcher.chat_created(chat.clone(), &member_ids).await;
    Ok((StatusCode::CREATED, Json(chat)))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<MarkReadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_member(&state, chat_id, claims.sub).await?;
    let outcome = state
        .dispatcher
        .mark_read(claims.sub, chat_id, req.timestamp)
        .await?;
    Ok(Json(MarkReadResponse {
        chat_id,
        last_read: ms_to_datetime(outcome.watermark),
        advanced: outcome.advanced,
    }))
}

pub async fn set_archived(
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ArchiveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_member(&state, chat_id, claims.sub).await?;
    let chat = with_db(&state, "set_chat_archived", move |db| {
        db.set_chat_archived(chat_id, req.archived)
    })
    .await?
    .ok_or_else(|| ApiError::not_found("chat"))?;
    Ok(Json(chat.into_model()))
}

pub async fn set_muted(
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<MuteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_member(&state, chat_id, claims.sub).await?;
    let user_id = claims.sub;
    let participant = with_db(&state, "set_participant_muted", move |db| {
        db.set_participant_muted(chat_id, user_id, req.muted)
    })
    .await?
    .ok_or_else(ApiError::unauthorized)?;
    Ok(Json(participant.into_model()))
}

pub async fn update_settings(
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ChatSettingsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_member(&state, chat_id, claims.sub).await?;
    if req.theme.as_deref().is_some_and(|t| t.len() > 64) {
        return Err(ApiError::invalid("theme exceeds 64 bytes"));
    }

    let user_id = claims.sub;
    let settings = ParticipantSettings {
        notification_level: req.notification_level.map(|l| l.as_str().to_string()),
        theme: req.theme,
        is_muted: req.is_muted,
        is_blocked: req.is_blocked,
    };
    let pinned = req.is_pinned;
    let (chat, participant) = with_db(&state, "update_chat_settings", move |db| {
        let Some(participant) = db.update_participant_settings(chat_id, user_id, &settings)? else {
            return Ok(None);
        };
        let chat = match pinned {
            Some(pinned) => db.set_chat_pinned(chat_id, pinned)?,
            None => db.get_chat(chat_id)?,
        };
        Ok(chat.map(|chat| (chat, participant)))
    })
    .await?
    .ok_or_else(ApiError::unauthorized)?;

    Ok(Json(ChatSettingsResponse {
        chat: chat.into_model(),
        participant: participant.into_model(),
    }))
}

/// Admins add members; the new member gets `chat_new` on every connection.
pub async fn add_participant(
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AddParticipantRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = claims.sub;
    let target = req.user_id;
    let actor_row = with_db(&state, "get_participant", move |db| {
        if db.get_chat(chat_id)?.is_none() {
            return Ok(None);
        }
        db.get_participant(chat_id, actor).map(Some)
    })
    .await?
    .ok_or_else(|| ApiError::not_found("chat"))?;
    if !actor_row.is_some_and(|p| p.is_admin) {
        return Err(ApiError::unauthorized());
    }

    let (added, chat, participant) = with_db(&state, "add_participant", move |db| {
        let Some(added) = db.add_participant(chat_id, target, req.is_admin)? else {
            return Ok(None);
        };
        let chat = db.get_chat(chat_id)?;
        let participant = db.get_participant(chat_id, target)?;
        Ok(chat.zip(participant).map(|(c, p)| (added, c, p)))
    })
    .await?
    .ok_or_else(|| ApiError::not_found("user"))?;

    if added {
        info!("User {} added user {} to chat {}", actor, target, chat_id);
        state.dispatcher.participant_added(chat.into_model(), target).await;
    }
    let status = if added { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(participant.into_model())))
}

/// Members may leave; admins may remove anyone.
pub async fn remove_participant(
    State(state): State<AppState>,
    Path((chat_id, user_id)): Path<(ChatId, UserId)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = claims.sub;
    if actor != user_id {
        let actor_row = with_db(&state, "get_participant", move |db| {
            db.get_participant(chat_id, actor)
        })
        .await?;
        if !actor_row.is_some_and(|p| p.is_admin) {
            return Err(ApiError::unauthorized());
        }
    }

    let removed = with_db(&state, "remove_participant", move |db| {
        db.remove_participant(chat_id, user_id)
    })
    .await?;
    if !removed {
        return Err(ApiError::not_found("participant"));
    }

    info!("User {} removed user {} from chat {}", actor, user_id, chat_id);
    state.dispatcher.participant_removed(chat_id, user_id).await;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::tests::{call, test_app};

    #[tokio::test]
    async fn chat_list_only_shows_own_chats() {
        let t = test_app();
        let (status, body) = call(&t.app, "GET", "/api/chats", Some(t.bob), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["id"], t.chat);
        assert_eq!(body[0]["unreadCount"], 0);
        assert_eq!(body[0]["memberIds"], json!([t.alice, t.bob]));

        let (_, body) = call(&t.app, "GET", "/api/chats", Some(t.carol), None).await;
        assert!(body.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_chat_validates_members() {
        let t = test_app();
        let (status, body) = call(
            &t.app,
            "POST",
            "/api/chats",
            Some(t.alice),
            Some(json!({"type": "individual", "memberIds": [t.bob, t.carol]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_payload");

        let (status, _) = call(
            &t.app,
            "POST",
            "/api/chats",
            Some(t.alice),
            Some(json!({"type": "individual", "memberIds": [999]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &t.app,
            "POST",
            "/api/chats",
            Some(t.alice),
            Some(json!({"type": "individual", "memberIds": [t.carol]})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["type"], "individual");
        let chat_id = body["id"].as_i64().unwrap();
        assert!(t.state.dispatcher.db().is_participant(chat_id, t.carol).unwrap());
    }

    #[tokio::test]
    async fn mark_read_reports_whether_the_watermark_moved() {
        let t = test_app();
        let uri = format!("/api/chat/{}/read", t.chat);
        let (status, body) = call(&t.app, "POST", &uri, Some(t.bob), Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["advanced"], true);

        let (_, body) = call(
            &t.app,
            "POST",
            &uri,
            Some(t.bob),
            Some(json!({"timestamp": "2001-01-01T00:00:00Z"})),
        )
        .await;
        assert_eq!(body["advanced"], false);

        let (status, _) = call(&t.app, "POST", &uri, Some(t.carol), Some(json!({}))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(&t.app, "POST", "/api/chat/404/read", Some(t.bob), Some(json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn settings_are_per_participant() {
        let t = test_app();
        let uri = format!("/api/chat/{}/settings", t.chat);
        let (status, body) = call(
            &t.app,
            "PATCH",
            &uri,
            Some(t.bob),
            Some(json!({"notificationLevel": "mentions", "theme": "dark", "isPinned": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["participant"]["notificationLevel"], "mentions");
        assert_eq!(body["participant"]["theme"], "dark");
        assert_eq!(body["chat"]["isPinned"], true);

        let alice = t.state.dispatcher.db().get_participant(t.chat, t.alice).unwrap().unwrap();
        assert_eq!(alice.notification_level, "all");

        let (status, body) = call(
            &t.app,
            "PATCH",
            &format!("/api/chat/{}/mute", t.chat),
            Some(t.bob),
            Some(json!({"muted": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["isMuted"], true);

        let (status, body) = call(
            &t.app,
            "PATCH",
            &format!("/api/chat/{}/archive", t.chat),
            Some(t.bob),
            Some(json!({"archived": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["isArchived"], true);
    }

    #[tokio::test]
    async fn blocking_an_individual_chat_stops_the_other_side() {
        let t = test_app();
        let (_, body) = call(
            &t.app,
            "POST",
            "/api/chats",
            Some(t.alice),
            Some(json!({"type": "individual", "memberIds": [t.carol]})),
        )
        .await;
        let dm = body["id"].as_i64().unwrap();

        let (status, body) = call(
            &t.app,
            "PATCH",
            &format!("/api/chat/{}/settings", dm),
            Some(t.carol),
            Some(json!({"isBlocked": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["participant"]["isBlocked"], true);

        let (status, body) = call(
            &t.app,
            "POST",
            &format!("/api/chat/{}/messages", dm),
            Some(t.alice),
            Some(json!({"content": "hello?"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "unauthorized");
        assert_eq!(body["message"], "this conversation has been blocked");
    }

    #[tokio::test]
    async fn only_admins_add_and_members_may_leave() {
        let t = test_app();
        let uri = format!("/api/chat/{}/participants", t.chat);

        let (status, _) = call(&t.app, "POST", &uri, Some(t.bob), Some(json!({"userId": t.carol}))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(&t.app, "POST", &uri, Some(t.alice), Some(json!({"userId": t.carol}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["userId"], t.carol);
        let (status, _) = call(&t.app, "POST", &uri, Some(t.alice), Some(json!({"userId": t.carol}))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(
            &t.app,
            "DELETE",
            &format!("{}/{}", uri, t.alice),
            Some(t.carol),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(&t.app, "DELETE", &format!("{}/{}", uri, t.carol), Some(t.carol), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&t.app, "DELETE", &format!("{}/{}", uri, t.carol), Some(t.alice), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
