use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy shared by the socket gateway and the REST surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("connection is not authenticated")]
    Unauthenticated,

    #[error("not a member of this chat")]
    Unauthorized,

    #[error("this conversation has been blocked")]
    Blocked,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("{0} not found")]
    NotFound(String),
}

impl ChatError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unauthenticated => ErrorCode::Unauthenticated,
            Self::Unauthorized | Self::Blocked => ErrorCode::Unauthorized,
            Self::InvalidPayload(_) => ErrorCode::InvalidPayload,
            Self::StorageUnavailable(_) => ErrorCode::StorageUnavailable,
            Self::NotFound(_) => ErrorCode::NotFound,
        }
    }

    /// Transient failures the client may retry as a whole operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthenticated,
    Unauthorized,
    InvalidPayload,
    StorageUnavailable,
    NotFound,
}

/// Reasons a connection fails the `auth` handshake.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,

    #[error("invalid or expired token")]
    InvalidToken,

    #[error("token does not belong to user {0}")]
    UserMismatch(i64),

    #[error("unknown user {0}")]
    UnknownUser(i64),

    #[error("connection is no longer open")]
    ConnectionClosed,

    #[error("authentication timed out")]
    Timeout,

    #[error("storage unavailable, retry later")]
    StorageUnavailable,
}

impl From<AuthError> for ChatError {
    fn from(_: AuthError) -> Self {
        ChatError::Unauthenticated
    }
}
