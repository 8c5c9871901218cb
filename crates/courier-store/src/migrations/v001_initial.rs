//! v001 -- Initial schema creation.
//!
//! Creates the message log, the users seen in it, and queued notifications.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (every party seen in the message log)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    user_id      TEXT PRIMARY KEY NOT NULL,
    address      TEXT NOT NULL,               -- normalized wallet address
    display_name TEXT,                        -- last non-empty name seen
    updated_at   TEXT NOT NULL                -- RFC-3339
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    message_id       TEXT PRIMARY KEY NOT NULL,  -- "<timestamp>-<suffix>"
    timestamp        INTEGER NOT NULL,           -- ms since epoch, sender clock
    sender_id        TEXT NOT NULL,
    sender_address   TEXT NOT NULL,
    sender_name      TEXT NOT NULL DEFAULT '',
    receiver_id      TEXT NOT NULL,
    receiver_address TEXT NOT NULL,
    content          TEXT NOT NULL,
    read             INTEGER NOT NULL DEFAULT 0  -- boolean 0/1, receiver side
);

CREATE INDEX IF NOT EXISTS idx_messages_sender_ts
    ON messages(sender_id, timestamp DESC);

CREATE INDEX IF NOT EXISTS idx_messages_receiver_ts
    ON messages(receiver_id, timestamp DESC);

-- ----------------------------------------------------------------
-- Notifications
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS notifications (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id    TEXT NOT NULL,                 -- recipient
    kind       TEXT NOT NULL,                 -- e.g. 'MESSAGE'
    actor_id   TEXT NOT NULL,
    message_id TEXT,
    preview    TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    seen       INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_notifications_user
    ON notifications(user_id, seen);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
