//! SQLite DDL for the check-in store.
//!
//! All `CREATE TABLE` / `CREATE INDEX` statements live here so they are
//! reviewable and testable in isolation.

use rusqlite::Connection;

/// Current schema version stamped into `schema_meta`.
pub(crate) const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Complete DDL for the check-in database.
///
/// Uses `IF NOT EXISTS` throughout so `apply_schema` is idempotent.
pub(crate) const SCHEMA_SQL: &str = r#"
-- Enable WAL mode for concurrent reads during writes.
PRAGMA journal_mode = WAL;

-- Enforce foreign key constraints.
PRAGMA foreign_keys = ON;

-- Schema version tracking.
CREATE TABLE IF NOT EXISTS schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Registered users. Timestamps are UTC epoch seconds throughout.
CREATE TABLE IF NOT EXISTS users (
    id                 INTEGER PRIMARY KEY,
    platform_user_id   INTEGER NOT NULL UNIQUE,
    chat_id            INTEGER NOT NULL,
    timezone           TEXT NOT NULL,
    checkin_time_local TEXT NOT NULL,      -- HH:MM local wall clock
    status             TEXT NOT NULL DEFAULT 'ACTIVE',
    pause_until        INTEGER,
    unreachable_since  INTEGER,
    created_at         INTEGER NOT NULL,
    updated_at         INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_users_chat ON users(chat_id);

-- Trusted contacts. At most one row per (user, contact identity).
CREATE TABLE IF NOT EXISTS trusted_contacts (
    id                  INTEGER PRIMARY KEY,
    user_id             INTEGER NOT NULL REFERENCES users(id),
    contact_platform_id INTEGER NOT NULL,
    contact_chat_id     INTEGER NOT NULL,
    status              TEXT NOT NULL DEFAULT 'PENDING',
    created_at          INTEGER NOT NULL,
    updated_at          INTEGER NOT NULL,
    UNIQUE (user_id, contact_platform_id)
);

CREATE INDEX IF NOT EXISTS idx_contacts_user ON trusted_contacts(user_id);

-- Append-only check-in evidence.
CREATE TABLE IF NOT EXISTS checkins (
    id          INTEGER PRIMARY KEY,
    user_id     INTEGER NOT NULL REFERENCES users(id),
    date_local  TEXT NOT NULL,             -- ISO yyyy-mm-dd
    created_at  INTEGER NOT NULL,
    photo_ref   TEXT NOT NULL,
    archive_key TEXT,
    geo_lat     REAL,
    geo_lon     REAL,
    is_late     INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_checkins_user_created ON checkins(user_id, created_at);

-- One obligation row per (user, local date).
CREATE TABLE IF NOT EXISTS daily_state (
    user_id                 INTEGER NOT NULL REFERENCES users(id),
    date_local              TEXT NOT NULL,
    due_at                  INTEGER NOT NULL,
    deadline_at             INTEGER NOT NULL,
    state                   TEXT NOT NULL DEFAULT 'PENDING',
    reminders_sent          INTEGER NOT NULL DEFAULT 0,
    escalation_sent_at      INTEGER,
    late_prompt_sent_at     INTEGER,
    late_prompt_response_at INTEGER,
    late_notify_contacts    INTEGER,
    PRIMARY KEY (user_id, date_local)
);

-- Notification ledger. The unique index on idempotency_key is the sole
-- serialization point guaranteeing at-most-one send per logical event.
CREATE TABLE IF NOT EXISTS notification_log (
    id              INTEGER PRIMARY KEY,
    idempotency_key TEXT NOT NULL UNIQUE,
    kind            TEXT NOT NULL,
    user_id         INTEGER NOT NULL,
    target_chat_id  INTEGER NOT NULL,
    status          TEXT NOT NULL DEFAULT 'PENDING',
    error_code      TEXT,
    error_message   TEXT,
    sent_at         INTEGER,
    created_at      INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_notification_user ON notification_log(user_id);
"#;

/// Apply the full schema to an open connection.
///
/// Safe to call multiple times; all statements use `IF NOT EXISTS`.
/// Seeds the schema version into `schema_meta` on a fresh database.
pub(crate) fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    let version_str = CURRENT_SCHEMA_VERSION.to_string();
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        rusqlite::params![version_str],
    )?;

    Ok(())
}

/// Read the current schema version from the database.
///
/// Returns `None` if the `schema_meta` table is empty or the key is missing.
pub(crate) fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<u32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_meta WHERE key = 'schema_version'")?;
    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => {
            let val: String = row.get(0)?;
            Ok(val.parse::<u32>().ok())
        }
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
