use crate::models::{ChatListRow, ChatRow, NotificationRow, ParticipantRow, ReadOutcome, UserRow};
use crate::{Database, now_ms};
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};

const CHAT_COLUMNS: &str =
    "c.id, c.type, c.name, c.avatar, c.is_pinned, c.is_muted, c.is_archived, c.created_at";

const PARTICIPANT_COLUMNS: &str = "p.chat_id, p.user_id, p.is_admin, p.is_muted, p.is_blocked, \
     p.notification_level, p.theme, p.last_read";

/// Participant overrides a member may change on their own row.
#[derive(Debug, Clone, Default)]
pub struct ParticipantSettings {
    pub notification_level: Option<String>,
    pub theme: Option<String>,
    pub is_muted: Option<bool>,
    pub is_blocked: Option<bool>,
}

impl Database {
    // -- Users --

    pub fn create_user(&self, name: &str) -> Result<i64> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (name, created_at) VALUES (?1, ?2)",
                params![name, now_ms()],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_user(&self, id: i64) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, name, status, created_at FROM users WHERE id = ?1",
                    [id],
                    |row| {
                        Ok(UserRow {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            status: row.get(2)?,
                            created_at: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Returns false when the user does not exist.
    pub fn set_user_status(&self, id: i64, status: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE users SET status = ?2 WHERE id = ?1",
                params![id, status],
            )?;
            Ok(changed > 0)
        })
    }

    // -- Chats --

    /// Create a chat and its participant rows in one transaction. The creator
    /// becomes an admin. Returns None if any member does not exist.
    pub fn create_chat(
        &self,
        kind: &str,
        name: &str,
        avatar: Option<&str>,
        creator_id: i64,
        member_ids: &[i64],
    ) -> Result<Option<ChatRow>> {
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;

            let mut members: Vec<i64> = member_ids.to_vec();
            members.push(creator_id);
            members.sort_unstable();
            members.dedup();

            for uid in &members {
                let exists: Option<i64> = tx
                    .query_row("SELECT 1 FROM users WHERE id = ?1", [uid], |r| r.get(0))
                    .optional()?;
                if exists.is_none() {
                    return Ok(None);
                }
            }

            let now = now_ms();
            tx.execute(
                "INSERT INTO chats (type, name, avatar, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![kind, name, avatar, now],
            )?;
            let chat_id = tx.last_insert_rowid();

            for uid in &members {
                tx.execute(
                    "INSERT INTO chat_participants (chat_id, user_id, is_admin, joined_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![chat_id, uid, *uid == creator_id, now],
                )?;
            }

            let chat = query_chat(&tx, chat_id)?;
            tx.commit()?;
            Ok(chat)
        })
    }

    pub fn get_chat(&self, chat_id: i64) -> Result<Option<ChatRow>> {
        self.with_conn(|conn| query_chat(conn, chat_id))
    }

    /// Chat ids a user participates in. Source of the room index.
    pub fn chat_ids_for_user(&self, user_id: i64) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT chat_id FROM chat_participants WHERE user_id = ?1 ORDER BY chat_id",
            )?;
            let ids = stmt
                .query_map([user_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<i64>, _>>()?;
            Ok(ids)
        })
    }

    pub fn chat_member_ids(&self, chat_id: i64) -> Result<Vec<i64>> {
        self.with_conn(|conn| query_member_ids(conn, chat_id))
    }

    pub fn is_participant(&self, chat_id: i64, user_id: i64) -> Result<bool> {
        self.with_conn(|conn| query_is_participant(conn, chat_id, user_id))
    }

    pub fn get_participant(&self, chat_id: i64, user_id: i64) -> Result<Option<ParticipantRow>> {
        self.with_conn(|conn| query_participant(conn, chat_id, user_id))
    }

    /// Chat list for a user: pinned first, then by most recent activity.
    pub fn list_chats_for_user(&self, user_id: i64) -> Result<Vec<ChatListRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {CHAT_COLUMNS}, {PARTICIPANT_COLUMNS},
                        COALESCE((SELECT MAX(m.timestamp) FROM messages m WHERE m.chat_id = c.id), c.created_at) AS activity
                 FROM chats c
                 JOIN chat_participants p ON p.chat_id = c.id
                 WHERE p.user_id = ?1
                 ORDER BY c.is_pinned DESC, activity DESC, c.id DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let pairs = stmt
                .query_map([user_id], |row| {
                    Ok((chat_from_row(row, 0)?, participant_from_row(row, 8)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut out = Vec::with_capacity(pairs.len());
            for (chat, participant) in pairs {
                let member_ids = query_member_ids(conn, chat.id)?;
                let last_message = crate::messages::query_last_message(conn, chat.id)?;
                let unread_count = query_unread_count(conn, chat.id, user_id, participant.last_read)?;
                out.push(ChatListRow {
                    chat,
                    participant,
                    member_ids,
                    last_message,
                    unread_count,
                });
            }
            Ok(out)
        })
    }

    /// Returns Some(true) if added, Some(false) if already a member, None if
    /// the chat or user does not exist.
    pub fn add_participant(&self, chat_id: i64, user_id: i64, is_admin: bool) -> Result<Option<bool>> {
        self.with_conn_mut(|conn| {
            if query_chat(conn, chat_id)?.is_none() {
                return Ok(None);
            }
            let user: Option<i64> = conn
                .query_row("SELECT 1 FROM users WHERE id = ?1", [user_id], |r| r.get(0))
                .optional()?;
            if user.is_none() {
                return Ok(None);
            }
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO chat_participants (chat_id, user_id, is_admin, joined_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![chat_id, user_id, is_admin, now_ms()],
            )?;
            Ok(Some(inserted > 0))
        })
    }

    /// Returns false when the user was not a member.
    pub fn remove_participant(&self, chat_id: i64, user_id: i64) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let removed = conn.execute(
                "DELETE FROM chat_participants WHERE chat_id = ?1 AND user_id = ?2",
                params![chat_id, user_id],
            )?;
            Ok(removed > 0)
        })
    }

    pub fn set_chat_archived(&self, chat_id: i64, archived: bool) -> Result<Option<ChatRow>> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE chats SET is_archived = ?2 WHERE id = ?1",
                params![chat_id, archived],
            )?;
            query_chat(conn, chat_id)
        })
    }

    pub fn set_chat_pinned(&self, chat_id: i64, pinned: bool) -> Result<Option<ChatRow>> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE chats SET is_pinned = ?2 WHERE id = ?1",
                params![chat_id, pinned],
            )?;
            query_chat(conn, chat_id)
        })
    }

    pub fn set_participant_muted(&self, chat_id: i64, user_id: i64, muted: bool) -> Result<Option<ParticipantRow>> {
        self.update_participant_settings(
            chat_id,
            user_id,
            &ParticipantSettings {
                is_muted: Some(muted),
                ..Default::default()
            },
        )
    }

    /// Apply per-participant overrides. None when the user is not a member.
    pub fn update_participant_settings(
        &self,
        chat_id: i64,
        user_id: i64,
        settings: &ParticipantSettings,
    ) -> Result<Option<ParticipantRow>> {
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;
            if !query_is_participant(&tx, chat_id, user_id)? {
                return Ok(None);
            }
            if let Some(level) = &settings.notification_level {
                tx.execute(
                    "UPDATE chat_participants SET notification_level = ?3 WHERE chat_id = ?1 AND user_id = ?2",
                    params![chat_id, user_id, level],
                )?;
            }
            if let Some(theme) = &settings.theme {
                tx.execute(
                    "UPDATE chat_participants SET theme = ?3 WHERE chat_id = ?1 AND user_id = ?2",
                    params![chat_id, user_id, theme],
                )?;
            }
            if let Some(muted) = settings.is_muted {
                tx.execute(
                    "UPDATE chat_participants SET is_muted = ?3 WHERE chat_id = ?1 AND user_id = ?2",
                    params![chat_id, user_id, muted],
                )?;
            }
            if let Some(blocked) = settings.is_blocked {
                tx.execute(
                    "UPDATE chat_participants SET is_blocked = ?3 WHERE chat_id = ?1 AND user_id = ?2",
                    params![chat_id, user_id, blocked],
                )?;
            }
            let row = query_participant(&tx, chat_id, user_id)?;
            tx.commit()?;
            Ok(row)
        })
    }

    // -- Read state --

    /// Move the read watermark forward. A watermark that is not newer than
    /// the stored one leaves it untouched. None when the user is not a member.
    pub fn advance_last_read(&self, chat_id: i64, user_id: i64, ts: i64) -> Result<Option<ReadOutcome>> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE chat_participants SET last_read = ?3
                 WHERE chat_id = ?1 AND user_id = ?2 AND (last_read IS NULL OR last_read < ?3)",
                params![chat_id, user_id, ts],
            )?;
            let stored: Option<Option<i64>> = conn
                .query_row(
                    "SELECT last_read FROM chat_participants WHERE chat_id = ?1 AND user_id = ?2",
                    params![chat_id, user_id],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(stored.map(|watermark| ReadOutcome {
                advanced: changed > 0,
                watermark: watermark.unwrap_or(ts),
            }))
        })
    }

    pub fn unread_count(&self, chat_id: i64, user_id: i64) -> Result<u32> {
        self.with_conn(|conn| {
            let last_read = query_participant(conn, chat_id, user_id)?.and_then(|p| p.last_read);
            query_unread_count(conn, chat_id, user_id, last_read)
        })
    }

    // -- Notifications --

    /// Queue a notification for each recipient whose overrides allow it:
    /// not muted, and either level `all` or level `mentions` with an
    /// `@name` mention in the content. Repeating the call for the same
    /// message queues nothing new. Returns the number queued.
    pub fn enqueue_message_notifications(
        &self,
        chat_id: i64,
        message_id: i64,
        recipients: &[i64],
        content: &str,
    ) -> Result<usize> {
        if recipients.is_empty() {
            return Ok(0);
        }
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;
            let now = now_ms();
            let mut queued = 0;
            for uid in recipients {
                queued += tx.execute(
                    "INSERT OR IGNORE INTO notifications (user_id, chat_id, message_id, content, created_at)
                     SELECT p.user_id, p.chat_id, ?3, ?4, ?5
                     FROM chat_participants p JOIN users u ON u.id = p.user_id
                     WHERE p.chat_id = ?1 AND p.user_id = ?2 AND p.is_muted = 0 AND p.is_blocked = 0
                       AND (p.notification_level = 'all'
                            OR (p.notification_level = 'mentions'
                                AND instr(lower(?4), '@' || lower(u.name)) > 0))",
                    params![chat_id, uid, message_id, content, now],
                )?;
            }
            tx.commit()?;
            Ok(queued)
        })
    }

    pub fn list_notifications(&self, user_id: i64, unread_only: bool, limit: u32) -> Result<Vec<NotificationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, chat_id, message_id, content, is_read, created_at
                 FROM notifications
                 WHERE user_id = ?1 AND (?2 = 0 OR is_read = 0)
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![user_id, unread_only, limit], |row| {
                    Ok(NotificationRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        chat_id: row.get(2)?,
                        message_id: row.get(3)?,
                        content: row.get(4)?,
                        is_read: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Returns false when the notification does not belong to the user.
    pub fn mark_notification_read(&self, id: i64, user_id: i64) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE notifications SET is_read = 1 WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )?;
            Ok(changed > 0)
        })
    }
}

pub(crate) fn query_chat(conn: &Connection, chat_id: i64) -> Result<Option<ChatRow>> {
    let sql = format!("SELECT {CHAT_COLUMNS} FROM chats c WHERE c.id = ?1");
    let row = conn
        .query_row(&sql, [chat_id], |row| chat_from_row(row, 0))
        .optional()?;
    Ok(row)
}

pub(crate) fn query_is_participant(conn: &Connection, chat_id: i64, user_id: i64) -> Result<bool> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM chat_participants WHERE chat_id = ?1 AND user_id = ?2",
            params![chat_id, user_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(exists.is_some())
}

pub(crate) fn query_participant(conn: &Connection, chat_id: i64, user_id: i64) -> Result<Option<ParticipantRow>> {
    let sql = format!(
        "SELECT {PARTICIPANT_COLUMNS} FROM chat_participants p WHERE p.chat_id = ?1 AND p.user_id = ?2"
    );
    let row = conn
        .query_row(&sql, params![chat_id, user_id], |row| participant_from_row(row, 0))
        .optional()?;
    Ok(row)
}

fn query_member_ids(conn: &Connection, chat_id: i64) -> Result<Vec<i64>> {
    let mut stmt =
        conn.prepare("SELECT user_id FROM chat_participants WHERE chat_id = ?1 ORDER BY user_id")?;
    let ids = stmt
        .query_map([chat_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<i64>, _>>()?;
    Ok(ids)
}

fn query_unread_count(conn: &Connection, chat_id: i64, user_id: i64, last_read: Option<i64>) -> Result<u32> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM messages
         WHERE chat_id = ?1 AND sender_id <> ?2 AND deleted = 0 AND timestamp > ?3",
        params![chat_id, user_id, last_read.unwrap_or(i64::MIN)],
        |r| r.get(0),
    )?;
    Ok(count)
}

fn chat_from_row(row: &rusqlite::Row<'_>, base: usize) -> rusqlite::Result<ChatRow> {
    Ok(ChatRow {
        id: row.get(base)?,
        kind: row.get(base + 1)?,
        name: row.get(base + 2)?,
        avatar: row.get(base + 3)?,
        is_pinned: row.get(base + 4)?,
        is_muted: row.get(base + 5)?,
        is_archived: row.get(base + 6)?,
        created_at: row.get(base + 7)?,
    })
}

fn participant_from_row(row: &rusqlite::Row<'_>, base: usize) -> rusqlite::Result<ParticipantRow> {
    Ok(ParticipantRow {
        chat_id: row.get(base)?,
        user_id: row.get(base + 1)?,
        is_admin: row.get(base + 2)?,
        is_muted: row.get(base + 3)?,
        is_blocked: row.get(base + 4)?,
        notification_level: row.get(base + 5)?,
        theme: row.get(base + 6)?,
        last_read: row.get(base + 7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (Database, i64, i64, i64) {
        let db = Database::open_in_memory().unwrap();
        let alice = db.create_user("alice").unwrap();
        let bob = db.create_user("bob").unwrap();
        let chat = db
            .create_chat("individual", "", None, alice, &[bob])
            .unwrap()
            .unwrap();
        (db, alice, bob, chat.id)
    }

    #[test]
    fn create_chat_adds_creator_as_admin() {
        let (db, alice, bob, chat) = seeded();
        assert_eq!(db.chat_member_ids(chat).unwrap(), vec![alice, bob]);
        assert!(db.get_participant(chat, alice).unwrap().unwrap().is_admin);
        assert!(!db.get_participant(chat, bob).unwrap().unwrap().is_admin);
        assert_eq!(db.chat_ids_for_user(bob).unwrap(), vec![chat]);
    }

    #[test]
    fn create_chat_with_unknown_member_is_rejected() {
        let (db, alice, _, _) = seeded();
        assert!(db.create_chat("group", "g", None, alice, &[999]).unwrap().is_none());
    }

    #[test]
    fn watermark_never_regresses() {
        let (db, alice, _, chat) = seeded();
        let first = db.advance_last_read(chat, alice, 2_000).unwrap().unwrap();
        assert!(first.advanced);
        assert_eq!(first.watermark, 2_000);

        let older = db.advance_last_read(chat, alice, 1_000).unwrap().unwrap();
        assert!(!older.advanced);
        assert_eq!(older.watermark, 2_000);

        let same = db.advance_last_read(chat, alice, 2_000).unwrap().unwrap();
        assert!(!same.advanced);

        assert!(db.advance_last_read(chat, 999, 3_000).unwrap().is_none());
    }

    #[test]
    fn membership_changes() {
        let (db, alice, _, chat) = seeded();
        let carol = db.create_user("carol").unwrap();
        assert_eq!(db.add_participant(chat, carol, false).unwrap(), Some(true));
        assert_eq!(db.add_participant(chat, carol, false).unwrap(), Some(false));
        assert_eq!(db.add_participant(chat, 404, false).unwrap(), None);
        assert!(db.is_participant(chat, carol).unwrap());
        assert!(db.remove_participant(chat, carol).unwrap());
        assert!(!db.remove_participant(chat, carol).unwrap());
        assert!(db.is_participant(chat, alice).unwrap());
    }

    #[test]
    fn settings_only_touch_given_fields() {
        let (db, alice, bob, chat) = seeded();
        let row = db
            .update_participant_settings(
                chat,
                alice,
                &ParticipantSettings {
                    theme: Some("dark".into()),
                    is_muted: Some(true),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(row.theme.as_deref(), Some("dark"));
        assert!(row.is_muted);
        assert_eq!(row.notification_level, "all");
        assert!(!db.get_participant(chat, bob).unwrap().unwrap().is_muted);
    }

    #[test]
    fn notifications_respect_overrides() {
        let (db, alice, bob, chat) = seeded();
        assert_eq!(
            db.enqueue_message_notifications(chat, 1, &[bob], "hello").unwrap(),
            1
        );

        db.update_participant_settings(
            chat,
            bob,
            &ParticipantSettings {
                notification_level: Some("mentions".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(db.enqueue_message_notifications(chat, 2, &[bob], "hello").unwrap(), 0);
        assert_eq!(db.enqueue_message_notifications(chat, 3, &[bob], "hi @Bob").unwrap(), 1);

        let list = db.list_notifications(bob, true, 10).unwrap();
        assert_eq!(list.len(), 2);
        assert!(db.mark_notification_read(list[0].id, bob).unwrap());
        assert!(!db.mark_notification_read(list[1].id, alice).unwrap());
        assert_eq!(db.list_notifications(bob, true, 10).unwrap().len(), 1);
    }

    #[test]
    fn blocked_participants_get_no_notifications() {
        let (db, _, bob, chat) = seeded();
        let row = db
            .update_participant_settings(
                chat,
                bob,
                &ParticipantSettings {
                    is_blocked: Some(true),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert!(row.is_blocked);
        assert_eq!(db.enqueue_message_notifications(chat, 1, &[bob], "hello").unwrap(), 0);
        assert!(db.list_notifications(bob, false, 10).unwrap().is_empty());
    }

    #[test]
    fn archive_and_status_updates() {
        let (db, alice, _, chat) = seeded();
        assert!(db.set_chat_archived(chat, true).unwrap().unwrap().is_archived);
        assert!(db.set_chat_pinned(chat, true).unwrap().unwrap().is_pinned);
        assert!(db.set_user_status(alice, "online").unwrap());
        assert_eq!(db.get_user(alice).unwrap().unwrap().status, "online");
        assert!(!db.set_user_status(999, "online").unwrap());
    }
}
