use rusqlite::Connection;
use tracing::info;

use crate::StoreResult;

pub fn run(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id            TEXT PRIMARY KEY,
                username      TEXT NOT NULL UNIQUE,
                password      TEXT NOT NULL,
                display_name  TEXT NOT NULL,
                avatar_ref    TEXT,
                created_at    TEXT NOT NULL
            );

            -- direct_key is the sorted participant pair for direct conversations,
            -- NULL for groups. The UNIQUE constraint settles creation races.
            CREATE TABLE conversations (
                id                    TEXT PRIMARY KEY,
                kind                  TEXT NOT NULL CHECK (kind IN ('direct', 'group')),
                name                  TEXT,
                description           TEXT,
                avatar_ref            TEXT,
                created_by            TEXT NOT NULL REFERENCES users(id),
                direct_key            TEXT UNIQUE,
                last_activity_at      TEXT NOT NULL,
                last_message_preview  TEXT,
                created_at            TEXT NOT NULL
            );

            CREATE TABLE memberships (
                conversation_id  TEXT NOT NULL REFERENCES conversations(id),
                user_id          TEXT NOT NULL REFERENCES users(id),
                role             TEXT NOT NULL CHECK (role IN ('owner', 'admin', 'member')),
                status           TEXT NOT NULL CHECK (status IN ('active', 'left', 'removed')),
                joined_at        TEXT NOT NULL,
                PRIMARY KEY (conversation_id, user_id)
            );

            CREATE INDEX idx_memberships_user ON memberships(user_id, status);

            -- seq breaks ties between equal created_at values
            CREATE TABLE messages (
                seq              INTEGER PRIMARY KEY AUTOINCREMENT,
                id               TEXT NOT NULL UNIQUE,
                conversation_id  TEXT NOT NULL REFERENCES conversations(id),
                sender_id        TEXT NOT NULL REFERENCES users(id),
                content          TEXT,
                kind             TEXT NOT NULL CHECK (kind IN ('text', 'system', 'media', 'reply')),
                reply_to         TEXT REFERENCES messages(id),
                attachments      TEXT NOT NULL DEFAULT '[]',
                metadata         TEXT,
                edited           INTEGER NOT NULL DEFAULT 0,
                edited_at        TEXT,
                deleted          INTEGER NOT NULL DEFAULT 0,
                deleted_at       TEXT,
                deleted_by       TEXT,
                created_at       TEXT NOT NULL
            );

            CREATE INDEX idx_messages_conversation
                ON messages(conversation_id, created_at, seq);

            CREATE TABLE reactions (
                message_id  TEXT NOT NULL REFERENCES messages(id),
                user_id     TEXT NOT NULL REFERENCES users(id),
                emoji       TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                PRIMARY KEY (message_id, user_id, emoji)
            );

            CREATE TABLE read_receipts (
                message_id  TEXT NOT NULL REFERENCES messages(id),
                user_id     TEXT NOT NULL REFERENCES users(id),
                read_at     TEXT NOT NULL,
                PRIMARY KEY (message_id, user_id)
            );

            CREATE INDEX idx_read_receipts_user ON read_receipts(user_id);

            CREATE TABLE typing_markers (
                conversation_id  TEXT NOT NULL REFERENCES conversations(id),
                user_id          TEXT NOT NULL REFERENCES users(id),
                started_at       TEXT NOT NULL,
                PRIMARY KEY (conversation_id, user_id)
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
