use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ChatError, ErrorCode};
use crate::models::{Chat, ChatId, ChatMessage, MessageId, MessageType, UserId, UserStatus};

/// Events sent FROM client TO server over the socket.
///
/// Wire shape: `{"type": "<event>", "data": {..}}`. Anything that does not
/// match one of these shapes is rejected with `InvalidPayload` at the
/// boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Must precede every other event on a connection.
    Auth(AuthPayload),

    Message(SendMessage),

    TypingStart(ChatRef),

    TypingStop(ChatRef),

    MarkRead(MarkRead),

    /// Explicit presence change (away / busy / online).
    UserStatus(StatusUpdate),

    /// Client activity ping; keeps presence from going idle.
    Heartbeat,
}

impl ClientEvent {
    pub fn parse(text: &str) -> Result<Self, ChatError> {
        serde_json::from_str(text).map_err(|e| ChatError::InvalidPayload(e.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::Message(_) => "message",
            Self::TypingStart(_) => "typing_start",
            Self::TypingStop(_) => "typing_stop",
            Self::MarkRead(_) => "mark_read",
            Self::UserStatus(_) => "user_status",
            Self::Heartbeat => "heartbeat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub user_id: UserId,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub chat_id: ChatId,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    pub reply_to_id: Option<MessageId>,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    /// Optimistic id assigned by the client; doubles as the idempotency key.
    pub client_id: Option<String>,
}

impl SendMessage {
    pub fn has_attachment(&self) -> bool {
        self.file_url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }

    /// Payload rules applied before anything touches storage.
    pub fn validate(&self, max_content_len: usize) -> Result<(), ChatError> {
        if self.content.trim().is_empty() && !self.has_attachment() {
            return Err(ChatError::InvalidPayload(
                "content must not be empty without an attachment".into(),
            ));
        }
        if self.content.chars().count() > max_content_len {
            return Err(ChatError::InvalidPayload(format!(
                "content exceeds {} characters",
                max_content_len
            )));
        }
        if self.kind == MessageType::System {
            return Err(ChatError::InvalidPayload(
                "system messages cannot be sent by clients".into(),
            ));
        }
        if matches!(self.kind, MessageType::Image | MessageType::File | MessageType::Audio)
            && !self.has_attachment()
        {
            return Err(ChatError::InvalidPayload(format!(
                "{} messages require fileUrl",
                self.kind.as_str()
            )));
        }
        if self.file_size.is_some_and(|s| s < 0) {
            return Err(ChatError::InvalidPayload("fileSize must not be negative".into()));
        }
        if self.client_id.as_deref().is_some_and(|c| c.is_empty() || c.len() > 64) {
            return Err(ChatError::InvalidPayload("clientId must be 1..=64 bytes".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRef {
    pub chat_id: ChatId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkRead {
    pub chat_id: ChatId,
    /// Read up to this instant; defaults to the server's now.
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: UserStatus,
}

/// Events sent FROM server TO client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    AuthSuccess(AuthSuccess),

    AuthError(AuthFailure),

    /// A persisted message, delivered to every member connection including
    /// the sender's own.
    Message(ChatMessage),

    TypingStart(TypingPayload),

    TypingStop(TypingPayload),

    /// A participant's read watermark advanced.
    MessageRead(ReadReceipt),

    UserStatus(StatusPayload),

    /// A chat the recipient was just added to.
    ChatNew(Chat),

    /// The recipient was removed from a chat.
    ChatRemoved(ChatRef),

    MessageUpdated(ChatMessage),

    MessageDeleted(MessageDeleted),

    MessageRestored(ChatMessage),

    ReactionAdded(ReactionPayload),

    ReactionRemoved(ReactionPayload),

    /// Failure of an event, sent only to the originating connection.
    Error(ErrorPayload),
}

impl ServerEvent {
    /// The chat this event is scoped to, if any.
    pub fn chat_id(&self) -> Option<ChatId> {
        match self {
            Self::Message(m) | Self::MessageUpdated(m) | Self::MessageRestored(m) => {
                Some(m.chat_id)
            }
            Self::TypingStart(t) | Self::TypingStop(t) => Some(t.chat_id),
            Self::MessageRead(r) => Some(r.chat_id),
            Self::ChatNew(c) => Some(c.id),
            Self::ChatRemoved(c) => Some(c.chat_id),
            Self::MessageDeleted(d) => Some(d.chat_id),
            Self::ReactionAdded(r) | Self::ReactionRemoved(r) => Some(r.chat_id),
            Self::AuthSuccess(_) | Self::AuthError(_) | Self::UserStatus(_) | Self::Error(_) => {
                None
            }
        }
    }

    pub fn error(event: &str, err: &ChatError, client_id: Option<String>) -> Self {
        Self::Error(ErrorPayload {
            event: event.to_string(),
            code: err.code(),
            message: err.to_string(),
            client_id,
        })
    }

    pub fn to_json(&self) -> String {
        // Every variant is plain data with string keys; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSuccess {
    pub user_id: UserId,
    pub session_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthFailure {
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub chat_id: ChatId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub user_id: UserId,
    pub status: UserStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeleted {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub permanent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionPayload {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub event: String,
    pub code: ErrorCode,
    pub message: String,
    pub client_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send(content: &str) -> SendMessage {
        SendMessage {
            chat_id: 1,
            content: content.into(),
            kind: MessageType::Text,
            reply_to_id: None,
            file_url: None,
            file_name: None,
            file_size: None,
            client_id: None,
        }
    }

    #[test]
    fn parses_tagged_client_events() {
        let ev = ClientEvent::parse(r#"{"type":"auth","data":{"userId":4,"token":"t"}}"#).unwrap();
        assert_eq!(ev, ClientEvent::Auth(AuthPayload { user_id: 4, token: "t".into() }));

        let ev = ClientEvent::parse(
            r#"{"type":"message","data":{"chatId":2,"content":"hi","type":"text","clientId":"c1"}}"#,
        )
        .unwrap();
        match ev {
            ClientEvent::Message(m) => {
                assert_eq!(m.chat_id, 2);
                assert_eq!(m.client_id.as_deref(), Some("c1"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let ev = ClientEvent::parse(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(ev, ClientEvent::Heartbeat);
    }

    #[test]
    fn rejects_unknown_and_malformed_events() {
        for raw in [
            r#"{"type":"explode","data":{}}"#,
            r#"{"type":"typing_start","data":{"chat":"x"}}"#,
            r#"{"data":{"chatId":1}}"#,
            "not json",
        ] {
            match ClientEvent::parse(raw) {
                Err(ChatError::InvalidPayload(_)) => {}
                other => panic!("{} parsed as {:?}", raw, other),
            }
        }
    }

    #[test]
    fn message_validation() {
        assert!(send("hello").validate(100).is_ok());
        assert!(send("   ").validate(100).is_err());
        assert!(send(&"x".repeat(101)).validate(100).is_err());

        let mut with_file = send("");
        with_file.kind = MessageType::File;
        assert!(with_file.validate(100).is_err());
        with_file.file_url = Some("https://files/x.pdf".into());
        assert!(with_file.validate(100).is_ok());

        let mut system = send("hi");
        system.kind = MessageType::System;
        assert!(system.validate(100).is_err());
    }

    #[test]
    fn server_events_are_scoped() {
        let ev = ServerEvent::TypingStart(TypingPayload { chat_id: 5, user_id: 1 });
        assert_eq!(ev.chat_id(), Some(5));
        let json: serde_json::Value = serde_json::from_str(&ev.to_json()).unwrap();
        assert_eq!(json["type"], "typing_start");
        assert_eq!(json["data"]["chatId"], 5);

        let err = ServerEvent::error("message", &ChatError::Unauthorized, Some("c".into()));
        assert_eq!(err.chat_id(), None);
    }
}
