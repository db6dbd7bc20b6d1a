//! Identity mapping: `(contentType, documentId) ↔ localId`.
//!
//! The `documentId` is the only identity that is stable across sites; local
//! primary keys diverge between master and replicas. Every inbound apply
//! translates through this table.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::warn;

use crate::error::Result;

use super::{ts, Db};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    pub content_type: String,
    pub document_id: String,
    pub local_id: String,
}

pub struct IdentityMapper {
    db: Arc<Db>,
}

impl IdentityMapper {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Translate a cross-site identity into the local row id.
    pub fn resolve(&self, content_type: &str, document_id: &str) -> Result<Option<String>> {
        self.db.with_conn(|conn| {
            let local = conn
                .query_row(
                    "SELECT local_id FROM identity_mappings
                      WHERE content_type = ?1 AND document_id = ?2",
                    params![content_type, document_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(local)
        })
    }

    /// Inverse lookup, used when capturing local writes.
    pub fn reverse(&self, content_type: &str, local_id: &str) -> Result<Option<String>> {
        self.db.with_conn(|conn| {
            let doc = conn
                .query_row(
                    "SELECT document_id FROM identity_mappings
                      WHERE content_type = ?1 AND local_id = ?2",
                    params![content_type, local_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(doc)
        })
    }

    /// Bind a document id to a local row. Idempotent: repeating the same
    /// binding is a no-op; rebinding to a *different* local id overwrites
    /// (bootstrap reconciliation) and is logged.
    pub fn bind(&self, content_type: &str, document_id: &str, local_id: &str) -> Result<()> {
        if let Some(existing) = self.resolve(content_type, document_id)? {
            if existing == local_id {
                return Ok(());
            }
            warn!(
                content_type,
                document_id,
                old_local_id = %existing,
                new_local_id = %local_id,
                "rebinding identity mapping"
            );
        }
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO identity_mappings (content_type, document_id, local_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (content_type, document_id) DO UPDATE SET
                     local_id = excluded.local_id",
                params![content_type, document_id, local_id, ts(Utc::now())],
            )?;
            Ok(())
        })
    }

    /// Bind many mappings in one transaction (initial sync).
    pub fn bulk_bind(&self, entries: &[MappingEntry]) -> Result<usize> {
        let now = ts(Utc::now());
        self.db.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "INSERT INTO identity_mappings (content_type, document_id, local_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (content_type, document_id) DO UPDATE SET
                     local_id = excluded.local_id",
            )?;
            for entry in entries {
                stmt.execute(params![
                    entry.content_type,
                    entry.document_id,
                    entry.local_id,
                    now
                ])?;
            }
            Ok(entries.len())
        })
    }

    /// Remove a mapping (operator action after resolving an orphan).
    pub fn unbind(&self, content_type: &str, document_id: &str) -> Result<bool> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM identity_mappings WHERE content_type = ?1 AND document_id = ?2",
                params![content_type, document_id],
            )?;
            Ok(n > 0)
        })
    }

    pub fn count(&self) -> Result<u64> {
        self.db.with_conn(|conn| {
            let n = conn.query_row("SELECT COUNT(*) FROM identity_mappings", [], |row| row.get(0))?;
            Ok(n)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> IdentityMapper {
        IdentityMapper::new(Db::open_in_memory().expect("open"))
    }

    #[test]
    fn bind_is_idempotent() {
        let m = mapper();
        m.bind("api::page.page", "d1", "local-7").expect("bind");
        m.bind("api::page.page", "d1", "local-7").expect("rebind");
        assert_eq!(
            m.resolve("api::page.page", "d1").expect("resolve").as_deref(),
            Some("local-7")
        );
        assert_eq!(m.count().expect("count"), 1);
    }

    #[test]
    fn rebind_overwrites_divergent_local_id() {
        let m = mapper();
        m.bind("api::page.page", "d1", "local-7").expect("bind");
        m.bind("api::page.page", "d1", "local-9").expect("rebind");
        assert_eq!(
            m.resolve("api::page.page", "d1").expect("resolve").as_deref(),
            Some("local-9")
        );
    }

    #[test]
    fn reverse_finds_document_id() {
        let m = mapper();
        m.bind("api::page.page", "d1", "local-7").expect("bind");
        assert_eq!(
            m.reverse("api::page.page", "local-7").expect("reverse").as_deref(),
            Some("d1")
        );
        assert!(m.reverse("api::page.page", "local-8").expect("miss").is_none());
    }

    #[test]
    fn mappings_are_scoped_by_content_type() {
        let m = mapper();
        m.bind("api::page.page", "d1", "local-1").expect("bind");
        m.bind("api::article.article", "d1", "local-2").expect("bind");
        assert_eq!(
            m.resolve("api::article.article", "d1").expect("resolve").as_deref(),
            Some("local-2")
        );
    }

    #[test]
    fn bulk_bind_commits_atomically() {
        let m = mapper();
        let entries: Vec<MappingEntry> = (0..5)
            .map(|i| MappingEntry {
                content_type: "api::page.page".into(),
                document_id: format!("d{i}"),
                local_id: format!("local-{i}"),
            })
            .collect();
        assert_eq!(m.bulk_bind(&entries).expect("bulk"), 5);
        assert_eq!(m.count().expect("count"), 5);
    }
}
