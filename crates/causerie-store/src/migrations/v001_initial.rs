//! v001 -- Initial schema creation.
//!
//! Creates the three core tables: `users`, `conversations`, and `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY NOT NULL,   -- identity-provider principal id
    display_name TEXT NOT NULL,
    email        TEXT NOT NULL,
    online       INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    last_seen_at TEXT,                        -- RFC-3339, set while offline
    avatar_url   TEXT,
    push_token   TEXT,                        -- opaque device token
    created_at   TEXT NOT NULL                -- RFC-3339
);

-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id                TEXT PRIMARY KEY NOT NULL,  -- "{lo}_{hi}", sorted pair
    participant_lo    TEXT NOT NULL,              -- FK -> users(id), smaller
    participant_hi    TEXT NOT NULL,              -- FK -> users(id), larger
    last_message_text TEXT NOT NULL,              -- denormalized summary
    last_sender_id    TEXT NOT NULL,
    last_message_at   TEXT NOT NULL,
    created_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_lo ON conversations(participant_lo, last_message_at DESC);
CREATE INDEX IF NOT EXISTS idx_conversations_hi ON conversations(participant_hi, last_message_at DESC);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    conversation_id TEXT NOT NULL,              -- FK -> conversations(id)
    seq             INTEGER NOT NULL,           -- per-conversation commit order
    sender_id       TEXT NOT NULL,
    text            TEXT NOT NULL,
    attachment_url  TEXT,
    created_at      TEXT NOT NULL,              -- RFC-3339, server-assigned

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
    UNIQUE (conversation_id, seq)
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_seq
    ON messages(conversation_id, seq);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
