//! v001 -- Initial schema creation.
//!
//! Creates the four core tables: `messages`, `files`, `relay_mappings` and
//! `settings`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Messages (the delivery ledger)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,  -- local message id
    direction     TEXT NOT NULL CHECK (direction IN ('inbound', 'outbound')),
    channel_type  INTEGER NOT NULL,
    conversation  TEXT NOT NULL,
    session       TEXT,
    conv_key      TEXT NOT NULL,                      -- "<type>:<conversation>"
    sender_key    TEXT NOT NULL,
    external_id   TEXT NOT NULL CHECK (external_id <> ''),
    contents      TEXT NOT NULL,                      -- JSON array of content blocks
    timestamp_ms  INTEGER NOT NULL,
    verified      INTEGER NOT NULL DEFAULT 0,         -- boolean 0/1, never reset

    UNIQUE (sender_key, external_id)
);

CREATE INDEX IF NOT EXISTS idx_messages_conv_ts
    ON messages(conv_key, timestamp_ms DESC);

-- ----------------------------------------------------------------
-- Files (attachment transfer records)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS files (
    file_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id     INTEGER,                           -- nullable FK -> messages(id)
    name           TEXT NOT NULL,
    url            TEXT,
    local_path     TEXT,
    size           INTEGER NOT NULL DEFAULT 0,
    cloud_type     INTEGER,                           -- cloud service code
    cloud_id       TEXT,
    download_state TEXT NOT NULL DEFAULT 'none',
    downloaded     INTEGER NOT NULL DEFAULT 0,
    total          INTEGER NOT NULL DEFAULT 0,
    created_at_ms  INTEGER NOT NULL,

    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_files_message_id ON files(message_id);

-- ----------------------------------------------------------------
-- Relay mappings (conversation -> remote push route)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS relay_mappings (
    channel_type INTEGER NOT NULL,
    conversation TEXT NOT NULL,
    uid          TEXT NOT NULL,
    push_from    TEXT NOT NULL,
    session_id   TEXT NOT NULL,

    PRIMARY KEY (channel_type, conversation)
);

-- ----------------------------------------------------------------
-- Settings (persisted key-value configuration)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
