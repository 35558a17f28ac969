use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::SendMessage;
use crate::models::{
    Chat, ChatId, ChatMessage, ChatParticipant, ChatType, MessageId, MessageType,
    NotificationLevel, ReactionGroup, UserId,
};

// -- JWT Claims --

/// JWT claims shared by the REST middleware and the socket `auth` handshake.
/// Tokens are issued by the external auth service; this crate only verifies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: UserId,
    pub name: String,
    pub exp: usize,
}

// -- Chats --

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    #[serde(flatten)]
    pub chat: Chat,
    pub participant: ChatParticipant,
    pub member_ids: Vec<UserId>,
    pub last_message: Option<ChatMessage>,
    pub unread_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateChatRequest {
    #[serde(rename = "type")]
    pub kind: ChatType,
    #[serde(default)]
    pub name: String,
    pub avatar: Option<String>,
    pub member_ids: Vec<UserId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AddParticipantRequest {
    pub user_id: UserId,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ArchiveRequest {
    pub archived: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MuteRequest {
    pub muted: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChatSettingsRequest {
    pub notification_level: Option<NotificationLevel>,
    pub theme: Option<String>,
    pub is_muted: Option<bool>,
    /// Blocking an individual chat stops the other side from posting and
    /// silences notifications for the blocker.
    pub is_blocked: Option<bool>,
    pub is_pinned: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSettingsResponse {
    pub chat: Chat,
    pub participant: ChatParticipant,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MarkReadRequest {
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadResponse {
    pub chat_id: ChatId,
    pub last_read: DateTime<Utc>,
    pub advanced: bool,
}

// -- Messages --

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    #[serde(flatten)]
    pub message: ChatMessage,
    pub reactions: Vec<ReactionGroup>,
}

/// REST form of a `message` event; the chat comes from the path.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    pub reply_to_id: Option<MessageId>,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub client_id: Option<String>,
}

impl SendMessageRequest {
    pub fn into_event(self, chat_id: ChatId) -> SendMessage {
        SendMessage {
            chat_id,
            content: self.content,
            kind: self.kind,
            reply_to_id: self.reply_to_id,
            file_url: self.file_url,
            file_name: self.file_name,
            file_size: self.file_size,
            client_id: self.client_id,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EditMessageRequest {
    pub content: String,
}

// -- Reactions --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToggleReactionRequest {
    pub emoji: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleReactionResponse {
    pub message_id: MessageId,
    pub emoji: String,
    pub added: bool,
}

// -- Notifications --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationQuery {
    #[serde(default)]
    pub unread_only: bool,
    #[serde(default = "default_notification_limit")]
    pub limit: u32,
}

fn default_notification_limit() -> u32 {
    50
}
