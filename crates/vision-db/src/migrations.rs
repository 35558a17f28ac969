use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub const LATEST_VERSION: i64 = 2;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (chat schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT NOT NULL,
                status      TEXT NOT NULL DEFAULT 'offline',
                created_at  INTEGER NOT NULL
            );

            CREATE TABLE chats (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                type        TEXT NOT NULL CHECK (type IN ('individual', 'group')),
                name        TEXT NOT NULL DEFAULT '',
                avatar      TEXT,
                is_pinned   INTEGER NOT NULL DEFAULT 0,
                is_muted    INTEGER NOT NULL DEFAULT 0,
                is_archived INTEGER NOT NULL DEFAULT 0,
                created_at  INTEGER NOT NULL
            );

            CREATE TABLE chat_participants (
                chat_id             INTEGER NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                user_id             INTEGER NOT NULL REFERENCES users(id),
                is_admin            INTEGER NOT NULL DEFAULT 0,
                is_muted            INTEGER NOT NULL DEFAULT 0,
                is_blocked          INTEGER NOT NULL DEFAULT 0,
                notification_level  TEXT NOT NULL DEFAULT 'all',
                theme               TEXT,
                last_read           INTEGER,
                joined_at           INTEGER NOT NULL,
                PRIMARY KEY (chat_id, user_id)
            );

            CREATE INDEX idx_participants_user ON chat_participants(user_id);

            CREATE TABLE messages (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id           INTEGER NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                sender_id         INTEGER NOT NULL REFERENCES users(id),
                content           TEXT NOT NULL,
                type              TEXT NOT NULL DEFAULT 'text',
                timestamp         INTEGER NOT NULL,
                reply_to_id       INTEGER,
                file_url          TEXT,
                file_name         TEXT,
                file_size         INTEGER,
                edited            INTEGER NOT NULL DEFAULT 0,
                deleted           INTEGER NOT NULL DEFAULT 0,
                deleted_at        INTEGER,
                original_content  TEXT,
                client_id         TEXT NOT NULL,
                UNIQUE (sender_id, client_id)
            );

            CREATE INDEX idx_messages_chat_order ON messages(chat_id, timestamp, id);

            CREATE TABLE reactions (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id  INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                user_id     INTEGER NOT NULL REFERENCES users(id),
                emoji       TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                UNIQUE (message_id, user_id, emoji)
            );

            CREATE INDEX idx_reactions_message ON reactions(message_id);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    if version < 2 {
        info!("Running migration v2 (notifications)");
        conn.execute_batch(
            "
            CREATE TABLE notifications (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id     INTEGER NOT NULL REFERENCES users(id),
                chat_id     INTEGER REFERENCES chats(id) ON DELETE CASCADE,
                message_id  INTEGER,
                content     TEXT NOT NULL,
                is_read     INTEGER NOT NULL DEFAULT 0,
                created_at  INTEGER NOT NULL,
                UNIQUE (user_id, message_id)
            );

            CREATE INDEX idx_notifications_user ON notifications(user_id, is_read);

            INSERT INTO schema_version (version) VALUES (2);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
