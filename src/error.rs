use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Crate-wide error taxonomy.
///
/// Component boundaries translate driver errors into these variants; raw
/// `rusqlite`/IO errors never cross the orchestrator boundary. Status
/// surfaces expose only the formatted string, full payloads stay in the
/// dead-letter store.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Bus or network failure. Retried with backoff, never parked before
    /// the configured attempt budget is spent.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Malformed message or payload that fails schema validation. Fatal per
    /// message: dead-lettered immediately.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Write-write conflict detected on apply. Not a failure — routed to the
    /// conflict resolver.
    #[error("conflict on {content_type}/{document_id} (base version {base_version}, local {local_version})")]
    Conflict {
        content_type: String,
        document_id: String,
        base_version: u64,
        local_version: u64,
    },

    /// Non-create operation arrived for a document with no identity mapping.
    #[error("orphan {operation} for {content_type}/{document_id}: no local mapping")]
    Orphan {
        content_type: String,
        document_id: String,
        operation: String,
    },

    /// The host entity service rejected the write (constraint, validation).
    /// Retried once, then dead-lettered.
    #[error("host apply error: {0}")]
    HostApply(String),

    /// The database or a connection is closing. Callers yield silently and
    /// resume after restart.
    #[error("shutting down")]
    Shutdown,

    /// Invalid configuration. Fails fast at startup.
    #[error("config error: {0}")]
    Config(String),

    /// Local persistence failure that is not a shutdown.
    #[error("storage error: {0}")]
    Storage(String),
}

impl SyncError {
    /// True for errors that should be retried in place rather than parked.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            SyncError::TransientNetwork(_) | SyncError::HostApply(_) | SyncError::Shutdown
        )
    }

    /// Reason tag recorded when this error parks a message.
    pub fn park_reason(&self) -> &'static str {
        match self {
            SyncError::Serialization(_) => "serialization",
            SyncError::Orphan { .. } => "orphan",
            SyncError::HostApply(_) => "host-apply",
            SyncError::Conflict { .. } => "conflict",
            SyncError::TransientNetwork(_) => "transport",
            _ => "internal",
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            // A closed or unopenable database surfaces as shutdown so cleanup
            // paths can yield instead of failing loudly.
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::NotADatabase
                    || code.code == rusqlite::ErrorCode::CannotOpen =>
            {
                SyncError::Shutdown
            }
            _ => SyncError::Storage(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::TransientNetwork(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retriable() {
        assert!(SyncError::TransientNetwork("broker gone".into()).is_retriable());
        assert!(SyncError::HostApply("constraint".into()).is_retriable());
        assert!(!SyncError::Serialization("bad json".into()).is_retriable());
        assert!(!SyncError::Config("missing shipId".into()).is_retriable());
    }

    #[test]
    fn park_reasons_match_taxonomy() {
        let orphan = SyncError::Orphan {
            content_type: "api::page.page".into(),
            document_id: "d99".into(),
            operation: "update".into(),
        };
        assert_eq!(orphan.park_reason(), "orphan");
        assert_eq!(
            SyncError::Serialization("x".into()).park_reason(),
            "serialization"
        );
    }
}
