use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};

use vision_types::api::{Claims, NotificationQuery};
use vision_types::models::Notification;

use crate::{ApiError, AppState, with_db};

pub async fn list_notifications(
    State(state): State<AppState>,
    Query(query): Query<NotificationQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = claims.sub;
    let limit = query.limit.min(200);
    let rows = with_db(&state, "list_notifications", move |db| {
        db.list_notifications(user_id, query.unread_only, limit)
    })
    .await?;
    let notifications: Vec<Notification> = rows.into_iter().map(|r| r.into_model()).collect();
    Ok(Json(notifications))
}

pub async fn mark_notification_read(
    State(state): State<AppState>,
    Path(notification_id): Path<i64>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = claims.sub;
    let found = with_db(&state, "mark_notification_read", move |db| {
        db.mark_notification_read(notification_id, user_id)
    })
    .await?;
    if !found {
        return Err(ApiError::not_found("notification"));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::tests::{call, test_app};

    #[tokio::test]
    async fn offline_members_find_their_notifications() {
        let t = test_app();
        call(
            &t.app,
            "POST",
            &format!("/api/chat/{}/messages", t.chat),
            Some(t.alice),
            Some(json!({"content": "are you there?"})),
        )
        .await;

        let (status, body) = call(&t.app, "GET", "/api/notifications?unreadOnly=true", Some(t.bob), None).await;
        assert_eq!(status, StatusCode::OK);
        let list = body.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["content"], "are you there?");
        assert_eq!(list[0]["chatId"], t.chat);

        let id = list[0]["id"].as_i64().unwrap();
        let (status, _) = call(&t.app, "POST", &format!("/api/notifications/{}/read", id), Some(t.alice), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "not alice's notification");
        let (status, _) = call(&t.app, "POST", &format!("/api/notifications/{}/read", id), Some(t.bob), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, body) = call(&t.app, "GET", "/api/notifications?unreadOnly=true", Some(t.bob), None).await;
        assert!(body.as_array().unwrap().is_empty());
        let (_, body) = call(&t.app, "GET", "/api/notifications", Some(t.bob), None).await;
        assert_eq!(body[0]["isRead"], true);
    }
}
