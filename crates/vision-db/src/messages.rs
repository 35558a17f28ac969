use crate::models::{MessageRow, ReactionRow};
use crate::queries::{query_is_participant, query_participant};
use crate::{Database, now_ms};
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};
use vision_types::models::{MessageCursor, TOMBSTONE};

const MESSAGE_COLUMNS: &str = "id, chat_id, sender_id, content, type, timestamp, reply_to_id, \
     file_url, file_name, file_size, edited, deleted, deleted_at, original_content, client_id";

/// A message ready to be written. The id and timestamp are assigned on insert.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: i64,
    pub sender_id: i64,
    pub content: String,
    pub kind: String,
    pub reply_to_id: Option<i64>,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(MessageRow),
    /// The (sender, client id) pair was already stored; carries the original.
    Duplicate(MessageRow),
    NotMember,
    /// The other side of an individual chat has blocked it.
    Blocked,
    /// `reply_to_id` does not name a message in the same chat.
    InvalidReply,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageMutation {
    Applied(MessageRow),
    NotFound,
    Forbidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    Added { chat_id: i64 },
    Removed { chat_id: i64 },
    MessageNotFound,
    NotMember,
}

impl Database {
    // -- Messages --

    /// Insert a message inside the writer lock. The timestamp is
    /// `max(now, newest timestamp in the chat)` so (timestamp, id) order
    /// matches insertion order.
    pub fn insert_message(&self, msg: &NewMessage) -> Result<InsertOutcome> {
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;

            if !query_is_participant(&tx, msg.chat_id, msg.sender_id)? {
                return Ok(InsertOutcome::NotMember);
            }

            let existing = tx
                .query_row(
                    &format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE sender_id = ?1 AND client_id = ?2"
                    ),
                    params![msg.sender_id, msg.client_id],
                    message_from_row,
                )
                .optional()?;
            if let Some(row) = existing {
                return Ok(InsertOutcome::Duplicate(row));
            }

            let blocked: bool = tx.query_row(
                "SELECT EXISTS(
                     SELECT 1 FROM chats c JOIN chat_participants p ON p.chat_id = c.id
                     WHERE c.id = ?1 AND c.type = 'individual'
                       AND p.user_id != ?2 AND p.is_blocked = 1)",
                params![msg.chat_id, msg.sender_id],
                |r| r.get(0),
            )?;
            if blocked {
                return Ok(InsertOutcome::Blocked);
            }

            if let Some(reply_to) = msg.reply_to_id {
                let same_chat: Option<i64> = tx
                    .query_row(
                        "SELECT 1 FROM messages WHERE id = ?1 AND chat_id = ?2",
                        params![reply_to, msg.chat_id],
                        |r| r.get(0),
                    )
                    .optional()?;
                if same_chat.is_none() {
                    return Ok(InsertOutcome::InvalidReply);
                }
            }

            let newest: Option<i64> = tx.query_row(
                "SELECT MAX(timestamp) FROM messages WHERE chat_id = ?1",
                [msg.chat_id],
                |r| r.get(0),
            )?;
            let timestamp = newest.map_or(now_ms(), |n| n.max(now_ms()));

            tx.execute(
                "INSERT INTO messages (chat_id, sender_id, content, type, timestamp, reply_to_id,
                                       file_url, file_name, file_size, client_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    msg.chat_id,
                    msg.sender_id,
                    msg.content,
                    msg.kind,
                    timestamp,
                    msg.reply_to_id,
                    msg.file_url,
                    msg.file_name,
                    msg.file_size,
                    msg.client_id,
                ],
            )?;
            let id = tx.last_insert_rowid();
            let row = query_message(&tx, id)?
                .ok_or_else(|| anyhow::anyhow!("Inserted message {} vanished", id))?;
            tx.commit()?;
            Ok(InsertOutcome::Inserted(row))
        })
    }

    pub fn get_message(&self, id: i64) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| query_message(conn, id))
    }

    /// Messages strictly after `cursor`, oldest first.
    pub fn messages_after(&self, chat_id: i64, cursor: MessageCursor, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE chat_id = ?1 AND (timestamp > ?2 OR (timestamp = ?2 AND id > ?3))
                 ORDER BY timestamp ASC, id ASC
                 LIMIT ?4"
            ))?;
            let rows = stmt
                .query_map(params![chat_id, cursor.timestamp, cursor.id, limit], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Messages strictly before `cursor`, newest first.
    pub fn messages_before(&self, chat_id: i64, cursor: MessageCursor, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE chat_id = ?1 AND (timestamp < ?2 OR (timestamp = ?2 AND id < ?3))
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?4"
            ))?;
            let rows = stmt
                .query_map(params![chat_id, cursor.timestamp, cursor.id, limit], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Cursor of a message, if it belongs to `chat_id`.
    pub fn message_cursor(&self, chat_id: i64, message_id: i64) -> Result<Option<MessageCursor>> {
        self.with_conn(|conn| {
            let cursor = conn
                .query_row(
                    "SELECT timestamp, id FROM messages WHERE id = ?1 AND chat_id = ?2",
                    params![message_id, chat_id],
                    |r| {
                        Ok(MessageCursor {
                            timestamp: r.get(0)?,
                            id: r.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(cursor)
        })
    }

    /// Only the sender may edit, and only while the message is live.
    pub fn edit_message(&self, id: i64, editor_id: i64, content: &str) -> Result<MessageMutation> {
        self.with_conn_mut(|conn| {
            let Some(row) = query_message(conn, id)? else {
                return Ok(MessageMutation::NotFound);
            };
            if row.deleted {
                return Ok(MessageMutation::NotFound);
            }
            if row.sender_id != editor_id {
                return Ok(MessageMutation::Forbidden);
            }
            conn.execute(
                "UPDATE messages SET content = ?2, edited = 1 WHERE id = ?1",
                params![id, content],
            )?;
            reload(conn, id)
        })
    }

    /// Replace the content with the tombstone. The sender or a chat admin may
    /// delete; the original text is kept until purge or permanent delete.
    pub fn soft_delete_message(&self, id: i64, actor_id: i64) -> Result<MessageMutation> {
        self.with_conn_mut(|conn| {
            let Some(row) = query_message(conn, id)? else {
                return Ok(MessageMutation::NotFound);
            };
            if row.deleted {
                return Ok(MessageMutation::NotFound);
            }
            if !may_moderate(conn, &row, actor_id)? {
                return Ok(MessageMutation::Forbidden);
            }
            conn.execute(
                "UPDATE messages
                 SET deleted = 1, deleted_at = ?2, original_content = content, content = ?3
                 WHERE id = ?1",
                params![id, now_ms(), TOMBSTONE],
            )?;
            reload(conn, id)
        })
    }

    /// Undo a soft delete that happened at or after `window_start`.
    pub fn restore_message(&self, id: i64, actor_id: i64, window_start: i64) -> Result<MessageMutation> {
        self.with_conn_mut(|conn| {
            let Some(row) = query_message(conn, id)? else {
                return Ok(MessageMutation::NotFound);
            };
            if !row.deleted || row.deleted_at.is_none_or(|at| at < window_start) {
                return Ok(MessageMutation::NotFound);
            }
            if !may_moderate(conn, &row, actor_id)? {
                return Ok(MessageMutation::Forbidden);
            }
            conn.execute(
                "UPDATE messages
                 SET deleted = 0, deleted_at = NULL,
                     content = COALESCE(original_content, content), original_content = NULL
                 WHERE id = ?1",
                [id],
            )?;
            reload(conn, id)
        })
    }

    /// Remove the row and its reactions. Returns the row as it was.
    pub fn permanent_delete_message(&self, id: i64, actor_id: i64) -> Result<MessageMutation> {
        self.with_conn_mut(|conn| {
            let Some(row) = query_message(conn, id)? else {
                return Ok(MessageMutation::NotFound);
            };
            if !may_moderate(conn, &row, actor_id)? {
                return Ok(MessageMutation::Forbidden);
            }
            conn.execute("DELETE FROM messages WHERE id = ?1", [id])?;
            Ok(MessageMutation::Applied(row))
        })
    }

    /// Permanently delete soft-deleted messages older than `cutoff`.
    pub fn purge_deleted_before(&self, cutoff: i64) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let purged = conn.execute(
                "DELETE FROM messages WHERE deleted = 1 AND deleted_at < ?1",
                [cutoff],
            )?;
            Ok(purged)
        })
    }

    // -- Reactions --

    /// Add the (message, user, emoji) triple, or remove it if present.
    pub fn toggle_reaction(&self, message_id: i64, user_id: i64, emoji: &str) -> Result<ToggleOutcome> {
        self.with_conn_mut(|conn| {
            let chat_id: Option<i64> = conn
                .query_row(
                    "SELECT chat_id FROM messages WHERE id = ?1 AND deleted = 0",
                    [message_id],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(chat_id) = chat_id else {
                return Ok(ToggleOutcome::MessageNotFound);
            };
            if !query_is_participant(conn, chat_id, user_id)? {
                return Ok(ToggleOutcome::NotMember);
            }

            let removed = conn.execute(
                "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                params![message_id, user_id, emoji],
            )?;
            if removed > 0 {
                return Ok(ToggleOutcome::Removed { chat_id });
            }

            conn.execute(
                "INSERT INTO reactions (message_id, user_id, emoji, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![message_id, user_id, emoji, now_ms()],
            )?;
            Ok(ToggleOutcome::Added { chat_id })
        })
    }

    pub fn reactions_for_messages(&self, message_ids: &[i64]) -> Result<Vec<ReactionRow>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let placeholders = vec!["?"; message_ids.len()].join(",");
            let mut stmt = conn.prepare(&format!(
                "SELECT id, message_id, user_id, emoji, created_at FROM reactions
                 WHERE message_id IN ({placeholders})
                 ORDER BY created_at ASC, id ASC"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(message_ids), |row| {
                    Ok(ReactionRow {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        user_id: row.get(2)?,
                        emoji: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

pub(crate) fn query_message(conn: &Connection, id: i64) -> Result<Option<MessageRow>> {
    let row = conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            [id],
            message_from_row,
        )
        .optional()?;
    Ok(row)
}

pub(crate) fn query_last_message(conn: &Connection, chat_id: i64) -> Result<Option<MessageRow>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = ?1
                 ORDER BY timestamp DESC, id DESC LIMIT 1"
            ),
            [chat_id],
            message_from_row,
        )
        .optional()?;
    Ok(row)
}

fn reload(conn: &Connection, id: i64) -> Result<MessageMutation> {
    Ok(query_message(conn, id)?.map_or(MessageMutation::NotFound, MessageMutation::Applied))
}

fn may_moderate(conn: &Connection, row: &MessageRow, actor_id: i64) -> Result<bool> {
    if row.sender_id == actor_id {
        return Ok(true);
    }
    Ok(query_participant(conn, row.chat_id, actor_id)?.is_some_and(|p| p.is_admin))
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        sender_id: row.get(2)?,
        content: row.get(3)?,
        kind: row.get(4)?,
        timestamp: row.get(5)?,
        reply_to_id: row.get(6)?,
        file_url: row.get(7)?,
        file_name: row.get(8)?,
        file_size: row.get(9)?,
        edited: row.get(10)?,
        deleted: row.get(11)?,
        deleted_at: row.get(12)?,
        original_content: row.get(13)?,
        client_id: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::ParticipantSettings;

    struct Fixture {
        db: Database,
        alice: i64,
        bob: i64,
        chat: i64,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let alice = db.create_user("alice").unwrap();
        let bob = db.create_user("bob").unwrap();
        let chat = db.create_chat("group", "team", None, alice, &[bob]).unwrap().unwrap();
        Fixture { db, alice, bob, chat: chat.id }
    }

    fn new_message(chat_id: i64, sender_id: i64, content: &str, client_id: &str) -> NewMessage {
        NewMessage {
            chat_id,
            sender_id,
            content: content.into(),
            kind: "text".into(),
            reply_to_id: None,
            file_url: None,
            file_name: None,
            file_size: None,
            client_id: client_id.into(),
        }
    }

    fn insert(f: &Fixture, sender: i64, content: &str, client_id: &str) -> MessageRow {
        match f.db.insert_message(&new_message(f.chat, sender, content, client_id)).unwrap() {
            InsertOutcome::Inserted(row) => row,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn insert_orders_and_dedupes() {
        let f = fixture();
        let a = insert(&f, f.alice, "one", "c1");
        let b = insert(&f, f.bob, "two", "c2");
        assert!(b.timestamp >= a.timestamp);
        assert!(b.id > a.id);

        match f.db.insert_message(&new_message(f.chat, f.alice, "one again", "c1")).unwrap() {
            InsertOutcome::Duplicate(row) => assert_eq!(row, a),
            other => panic!("unexpected {:?}", other),
        }
        // Same client id from a different sender is a different message.
        insert(&f, f.bob, "three", "c1");
    }

    #[test]
    fn insert_rejects_outsiders_and_foreign_replies() {
        let f = fixture();
        let mallory = f.db.create_user("mallory").unwrap();
        assert_eq!(
            f.db.insert_message(&new_message(f.chat, mallory, "hi", "m1")).unwrap(),
            InsertOutcome::NotMember
        );

        let other = f.db.create_chat("group", "other", None, f.alice, &[]).unwrap().unwrap();
        let foreign = match f.db.insert_message(&new_message(other.id, f.alice, "x", "o1")).unwrap() {
            InsertOutcome::Inserted(row) => row,
            o => panic!("unexpected {:?}", o),
        };
        let mut reply = new_message(f.chat, f.alice, "re", "r1");
        reply.reply_to_id = Some(foreign.id);
        assert_eq!(f.db.insert_message(&reply).unwrap(), InsertOutcome::InvalidReply);
    }

    #[test]
    fn blocked_individual_chat_refuses_the_other_side() {
        let f = fixture();
        let dm = f
            .db
            .create_chat("individual", "", None, f.alice, &[f.bob])
            .unwrap()
            .unwrap();
        f.db.update_participant_settings(
            dm.id,
            f.bob,
            &ParticipantSettings {
                is_blocked: Some(true),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(
            f.db.insert_message(&new_message(dm.id, f.alice, "hello?", "b1")).unwrap(),
            InsertOutcome::Blocked
        );
        // The blocker can still write, and group chats ignore the flag.
        assert!(matches!(
            f.db.insert_message(&new_message(dm.id, f.bob, "bye", "b2")).unwrap(),
            InsertOutcome::Inserted(_)
        ));
        f.db.update_participant_settings(
            f.chat,
            f.bob,
            &ParticipantSettings {
                is_blocked: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
        insert(&f, f.alice, "group still works", "b3");
    }

    #[test]
    fn catch_up_after_cursor_has_no_gaps() {
        let f = fixture();
        let rows: Vec<MessageRow> = (1..=55)
            .map(|i| insert(&f, f.alice, &format!("m{}", i), &format!("c{}", i)))
            .collect();
        let fiftieth = f.db.message_cursor(f.chat, rows[49].id).unwrap().unwrap();

        let missed = f.db.messages_after(f.chat, fiftieth, 100).unwrap();
        let contents: Vec<&str> = missed.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m51", "m52", "m53", "m54", "m55"]);

        let page = f.db.messages_after(f.chat, MessageCursor::START, 10).unwrap();
        assert_eq!(page.len(), 10);
        assert_eq!(page[0].content, "m1");

        let older = f.db.messages_before(f.chat, fiftieth, 3).unwrap();
        let contents: Vec<&str> = older.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m49", "m48", "m47"]);

        assert!(f.db.message_cursor(f.chat + 1, rows[0].id).unwrap().is_none());
    }

    #[test]
    fn edit_is_sender_only() {
        let f = fixture();
        let m = insert(&f, f.bob, "typo", "c1");
        assert_eq!(f.db.edit_message(m.id, f.alice, "x").unwrap(), MessageMutation::Forbidden);
        match f.db.edit_message(m.id, f.bob, "fixed").unwrap() {
            MessageMutation::Applied(row) => {
                assert_eq!(row.content, "fixed");
                assert!(row.edited);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(f.db.edit_message(999, f.bob, "x").unwrap(), MessageMutation::NotFound);
    }

    #[test]
    fn soft_delete_restore_then_permanent_delete() {
        let f = fixture();
        let m = insert(&f, f.bob, "secret", "c1");

        let deleted = match f.db.soft_delete_message(m.id, f.bob).unwrap() {
            MessageMutation::Applied(row) => row,
            other => panic!("unexpected {:?}", other),
        };
        assert!(deleted.deleted);
        assert_eq!(deleted.content, TOMBSTONE);
        assert_eq!(deleted.original_content.as_deref(), Some("secret"));

        let restored = match f.db.restore_message(m.id, f.bob, 0).unwrap() {
            MessageMutation::Applied(row) => row,
            other => panic!("unexpected {:?}", other),
        };
        assert!(!restored.deleted);
        assert_eq!(restored.content, "secret");

        // Alice created the chat and is an admin.
        assert!(matches!(
            f.db.permanent_delete_message(m.id, f.alice).unwrap(),
            MessageMutation::Applied(_)
        ));
        assert!(f.db.get_message(m.id).unwrap().is_none());
        assert_eq!(f.db.restore_message(m.id, f.bob, 0).unwrap(), MessageMutation::NotFound);
    }

    #[test]
    fn restore_honours_window_and_purge() {
        let f = fixture();
        let m = insert(&f, f.alice, "gone", "c1");
        f.db.soft_delete_message(m.id, f.alice).unwrap();

        let future = now_ms() + 60_000;
        assert_eq!(
            f.db.restore_message(m.id, f.alice, future).unwrap(),
            MessageMutation::NotFound
        );
        assert_eq!(f.db.soft_delete_message(m.id, f.alice).unwrap(), MessageMutation::NotFound);
        assert_eq!(f.db.purge_deleted_before(future).unwrap(), 1);
        assert!(f.db.get_message(m.id).unwrap().is_none());
    }

    #[test]
    fn non_admin_cannot_delete_others_messages() {
        let f = fixture();
        let m = insert(&f, f.alice, "mine", "c1");
        assert_eq!(f.db.soft_delete_message(m.id, f.bob).unwrap(), MessageMutation::Forbidden);
        assert_eq!(
            f.db.permanent_delete_message(m.id, f.bob).unwrap(),
            MessageMutation::Forbidden
        );
    }

    #[test]
    fn reaction_toggles_add_remove_add() {
        let f = fixture();
        let m = insert(&f, f.alice, "hello", "c1");
        let chat_id = f.chat;

        assert_eq!(f.db.toggle_reaction(m.id, f.bob, "👍").unwrap(), ToggleOutcome::Added { chat_id });
        assert_eq!(f.db.toggle_reaction(m.id, f.bob, "👍").unwrap(), ToggleOutcome::Removed { chat_id });
        assert_eq!(f.db.toggle_reaction(m.id, f.bob, "👍").unwrap(), ToggleOutcome::Added { chat_id });

        let rows = f.db.reactions_for_messages(&[m.id]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, f.bob);

        let outsider = f.db.create_user("eve").unwrap();
        assert_eq!(f.db.toggle_reaction(m.id, outsider, "👍").unwrap(), ToggleOutcome::NotMember);
        assert_eq!(f.db.toggle_reaction(404, f.bob, "👍").unwrap(), ToggleOutcome::MessageNotFound);
    }

    #[test]
    fn chat_list_reports_unread_and_last_message() {
        let f = fixture();
        insert(&f, f.alice, "a", "c1");
        let last = insert(&f, f.alice, "b", "c2");

        let list = f.db.list_chats_for_user(f.bob).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].unread_count, 2);
        assert_eq!(list[0].last_message.as_ref().map(|m| m.id), Some(last.id));
        assert_eq!(list[0].member_ids, vec![f.alice, f.bob]);

        f.db.advance_last_read(f.chat, f.bob, last.timestamp).unwrap();
        assert_eq!(f.db.unread_count(f.chat, f.bob).unwrap(), 0);
        assert_eq!(f.db.unread_count(f.chat, f.alice).unwrap(), 0);
    }
}
