//! Database row types — these map directly to SQLite rows.
//! Distinct from vision-types API models to keep the DB layer independent;
//! `into_model` does the conversion at the edge.

use tracing::warn;
use vision_types::models::{
    Chat, ChatParticipant, ChatMessage, ChatType, MessageType, Notification, NotificationLevel,
    User, UserStatus, ms_to_datetime,
};

pub struct UserRow {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub created_at: i64,
}

impl UserRow {
    pub fn into_model(self) -> User {
        let status = self.status.parse().unwrap_or_else(|e| {
            warn!("Corrupt status on user {}: {}", self.id, e);
            UserStatus::Offline
        });
        User {
            id: self.id,
            name: self.name,
            status,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRow {
    pub id: i64,
    pub kind: String,
    pub name: String,
    pub avatar: Option<String>,
    pub is_pinned: bool,
    pub is_muted: bool,
    pub is_archived: bool,
    pub created_at: i64,
}

impl ChatRow {
    pub fn into_model(self) -> Chat {
        let kind = self.kind.parse().unwrap_or_else(|e| {
            warn!("Corrupt type on chat {}: {}", self.id, e);
            ChatType::Group
        });
        Chat {
            id: self.id,
            kind,
            name: self.name,
            avatar: self.avatar,
            is_pinned: self.is_pinned,
            is_muted: self.is_muted,
            is_archived: self.is_archived,
            created_at: ms_to_datetime(self.created_at),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParticipantRow {
    pub chat_id: i64,
    pub user_id: i64,
    pub is_admin: bool,
    pub is_muted: bool,
    pub is_blocked: bool,
    pub notification_level: String,
    pub theme: Option<String>,
    pub last_read: Option<i64>,
}

impl ParticipantRow {
    pub fn into_model(self) -> ChatParticipant {
        let notification_level = self.notification_level.parse().unwrap_or_else(|e| {
            warn!(
                "Corrupt notification_level on participant ({}, {}): {}",
                self.chat_id, self.user_id, e
            );
            NotificationLevel::All
        });
        ChatParticipant {
            chat_id: self.chat_id,
            user_id: self.user_id,
            is_admin: self.is_admin,
            is_muted: self.is_muted,
            is_blocked: self.is_blocked,
            notification_level,
            theme: self.theme,
            last_read: self.last_read.map(ms_to_datetime),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageRow {
    pub id: i64,
    pub chat_id: i64,
    pub sender_id: i64,
    pub content: String,
    pub kind: String,
    pub timestamp: i64,
    pub reply_to_id: Option<i64>,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub edited: bool,
    pub deleted: bool,
    pub deleted_at: Option<i64>,
    pub original_content: Option<String>,
    pub client_id: String,
}

impl MessageRow {
    pub fn into_model(self) -> ChatMessage {
        let kind = self.kind.parse().unwrap_or_else(|e| {
            warn!("Corrupt type on message {}: {}", self.id, e);
            MessageType::Text
        });
        ChatMessage {
            id: self.id,
            chat_id: self.chat_id,
            sender_id: self.sender_id,
            content: self.content,
            kind,
            timestamp: ms_to_datetime(self.timestamp),
            reply_to_id: self.reply_to_id,
            file_url: self.file_url,
            file_name: self.file_name,
            file_size: self.file_size,
            edited: self.edited,
            deleted: self.deleted,
            client_id: Some(self.client_id),
        }
    }
}

pub struct ReactionRow {
    pub id: i64,
    pub message_id: i64,
    pub user_id: i64,
    pub emoji: String,
    pub created_at: i64,
}

pub struct NotificationRow {
    pub id: i64,
    pub user_id: i64,
    pub chat_id: Option<i64>,
    pub message_id: Option<i64>,
    pub content: String,
    pub is_read: bool,
    pub created_at: i64,
}

impl NotificationRow {
    pub fn into_model(self) -> Notification {
        Notification {
            id: self.id,
            user_id: self.user_id,
            chat_id: self.chat_id,
            message_id: self.message_id,
            content: self.content,
            is_read: self.is_read,
            created_at: ms_to_datetime(self.created_at),
        }
    }
}

/// One entry of a user's chat list.
pub struct ChatListRow {
    pub chat: ChatRow,
    pub participant: ParticipantRow,
    pub member_ids: Vec<i64>,
    pub last_message: Option<MessageRow>,
    pub unread_count: u32,
}

/// Result of advancing a read watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// False when the requested watermark was not newer than the stored one.
    pub advanced: bool,
    /// The stored watermark after the call.
    pub watermark: i64,
}
