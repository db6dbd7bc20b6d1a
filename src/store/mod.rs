//! Sqlite-backed persistence for the replication engine.
//!
//! One connection behind a mutex; writes run in transactions, reads use
//! prepared statements. Component stores (`queue`, `processed`, ...) share
//! the same [`Db`] handle. All timestamps are stored as fixed-width RFC 3339
//! UTC strings so lexicographic order equals chronological order.

pub mod conflicts;
pub mod dead_letter;
pub mod identity;
pub mod processed;
pub mod queue;
pub mod schema;
pub mod ships;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, Transaction};

use crate::error::{Result, SyncError};

/// Shared database handle.
pub struct Db {
    conn: Mutex<Connection>,
    shutting_down: AtomicBool,
}

impl Db {
    /// Open (or create) the engine database at `path` and apply migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Db>> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory database for tests and dry runs.
    pub fn open_in_memory() -> Result<Arc<Db>> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Arc<Db>> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Arc::new(Db {
            conn: Mutex::new(conn),
            shutting_down: AtomicBool::new(false),
        });
        schema::migrate(&db)?;
        Ok(db)
    }

    /// Run a read or single-statement write against the connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        if self.is_shutting_down() {
            return Err(SyncError::Shutdown);
        }
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` inside a transaction; commit on `Ok`, roll back on `Err`.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        if self.is_shutting_down() {
            return Err(SyncError::Shutdown);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Flip the shutdown flag. Subsequent calls observe [`SyncError::Shutdown`]
    /// and yield; in-flight statements finish normally.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

/// Fixed-width RFC 3339 UTC timestamp (microsecond precision, `Z` suffix).
pub fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp back into `DateTime<Utc>`.
pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::Storage(format!("bad timestamp {raw:?}: {e}")))
}
