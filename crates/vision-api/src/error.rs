use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use vision_types::{ChatError, ErrorCode};

/// A [`ChatError`] rendered as an HTTP response.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ApiError(#[from] pub ChatError);

impl ApiError {
    pub fn storage(op: &str) -> Self {
        Self(ChatError::StorageUnavailable(op.to_string()))
    }

    pub fn not_found(what: &str) -> Self {
        Self(ChatError::NotFound(what.to_string()))
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self(ChatError::InvalidPayload(reason.into()))
    }

    pub fn unauthorized() -> Self {
        Self(ChatError::Unauthorized)
    }

    pub fn status(&self) -> StatusCode {
        match self.0.code() {
            ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorCode::Unauthorized => StatusCode::FORBIDDEN,
            ErrorCode::InvalidPayload => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.0.code(),
            "message": self.0.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_code_has_its_own_status() {
        assert_eq!(ApiError(ChatError::Unauthenticated).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::unauthorized().status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::invalid("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::not_found("chat").status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::storage("insert").status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn response_carries_code_and_message() {
        let res = ApiError::not_found("message").into_response();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
