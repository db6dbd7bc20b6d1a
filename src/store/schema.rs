//! Schema migrations, applied in order at startup and tracked through
//! sqlite's `user_version` pragma.

use rusqlite::Connection;

use crate::error::Result;

use super::Db;

/// Ordered migration scripts. Append only; never edit a shipped entry.
const MIGRATIONS: &[&str] = &[
    // v1 — initial schema
    r#"
    CREATE TABLE processed_messages (
        message_id   TEXT PRIMARY KEY,
        ship_id      TEXT,
        content_type TEXT NOT NULL,
        document_id  TEXT NOT NULL,
        operation    TEXT NOT NULL,
        status       TEXT NOT NULL CHECK (status IN ('processed', 'failed')),
        processed_at TEXT NOT NULL
    );
    CREATE INDEX idx_processed_at ON processed_messages (processed_at);

    CREATE TABLE sync_queue (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        message_id      TEXT NOT NULL UNIQUE,
        ship_id         TEXT NOT NULL,
        content_type    TEXT NOT NULL,
        document_id     TEXT NOT NULL,
        operation       TEXT NOT NULL,
        message         TEXT NOT NULL,
        state           TEXT NOT NULL DEFAULT 'pending'
                        CHECK (state IN ('pending', 'sending', 'sent', 'failed')),
        attempt         INTEGER NOT NULL DEFAULT 0,
        next_attempt_at TEXT NOT NULL,
        last_error      TEXT,
        occurred_at     TEXT NOT NULL,
        enqueued_at     TEXT NOT NULL,
        sent_at         TEXT
    );
    CREATE INDEX idx_queue_claim ON sync_queue (ship_id, state, next_attempt_at);
    CREATE INDEX idx_queue_order ON sync_queue (occurred_at, id);

    CREATE TABLE dead_letter (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        message_id    TEXT NOT NULL UNIQUE,
        message       TEXT NOT NULL,
        reason        TEXT NOT NULL,
        state         TEXT NOT NULL DEFAULT 'pending'
                      CHECK (state IN ('pending', 'retrying', 'exhausted', 'resolved')),
        attempts      INTEGER NOT NULL DEFAULT 0,
        last_error    TEXT,
        first_seen_at TEXT NOT NULL,
        last_seen_at  TEXT NOT NULL
    );
    CREATE INDEX idx_dead_letter_state ON dead_letter (state);

    CREATE TABLE ships (
        ship_id             TEXT PRIMARY KEY,
        ship_name           TEXT NOT NULL,
        connectivity_status TEXT NOT NULL CHECK (connectivity_status IN ('online', 'offline')),
        last_seen_at        TEXT NOT NULL,
        created_at          TEXT NOT NULL
    );

    CREATE TABLE identity_mappings (
        content_type TEXT NOT NULL,
        document_id  TEXT NOT NULL,
        local_id     TEXT NOT NULL,
        created_at   TEXT NOT NULL,
        PRIMARY KEY (content_type, document_id)
    );
    CREATE INDEX idx_identity_reverse ON identity_mappings (content_type, local_id);

    CREATE TABLE conflicts (
        id              TEXT PRIMARY KEY,
        message_id      TEXT NOT NULL,
        content_type    TEXT NOT NULL,
        document_id     TEXT NOT NULL,
        local_snapshot  TEXT,
        remote_snapshot TEXT,
        detected_at     TEXT NOT NULL,
        state           TEXT NOT NULL DEFAULT 'open' CHECK (state IN ('open', 'resolved')),
        resolution      TEXT
    );
    CREATE INDEX idx_conflicts_state ON conflicts (state);
    "#,
];

/// Apply any migrations newer than the database's `user_version`.
pub fn migrate(db: &Db) -> Result<()> {
    db.with_conn(|conn| {
        let current = user_version(conn)?;
        for (idx, script) in MIGRATIONS.iter().enumerate() {
            let version = (idx + 1) as i64;
            if version <= current {
                continue;
            }
            conn.execute_batch(script)?;
            conn.pragma_update(None, "user_version", version)?;
            tracing::info!(version, "applied schema migration");
        }
        Ok(())
    })
}

fn user_version(conn: &Connection) -> Result<i64> {
    let version = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}
