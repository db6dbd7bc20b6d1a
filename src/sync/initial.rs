//! Initial sync: one-shot bulk bootstrap of a fresh replica from the
//! master's HTTP API.
//!
//! Paginates each content type's list endpoint, binds every document id to
//! a local row and persists a copy. `bind` is idempotent, so a failed run
//! is resumed simply by invoking it again.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::Result;
use crate::host::{HostApp, WriteOrigin};
use crate::store::identity::IdentityMapper;
use crate::transport::TransportError;

/// Page size used against the master's list endpoint.
const PAGE_SIZE: u32 = 100;

// ============================================================================
// MasterApi — the master's list endpoint
// ============================================================================

/// One document as served by the master.
#[derive(Debug, Clone)]
pub struct RemoteDocument {
    pub document_id: String,
    pub payload: Value,
    pub version: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DocumentPage {
    pub documents: Vec<RemoteDocument>,
    pub has_more: bool,
}

/// User-implemented HTTP client for the master's paginated list endpoint.
#[async_trait]
pub trait MasterApi: Send + Sync {
    /// Fetch one page (1-based) of documents for a content type.
    async fn list_documents(
        &self,
        content_type: &str,
        page: u32,
        page_size: u32,
    ) -> std::result::Result<DocumentPage, TransportError>;
}

// ============================================================================
// Request / report
// ============================================================================

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialSyncRequest {
    pub master_url: String,
    #[serde(default)]
    pub master_api_token: Option<String>,
    /// Restrict the run; `None` bootstraps every subscribed type.
    #[serde(default)]
    pub content_types: Option<Vec<String>>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeReport {
    pub fetched: u64,
    pub bound: u64,
    pub created: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialSyncReport {
    pub dry_run: bool,
    pub per_type: BTreeMap<String, TypeReport>,
}

/// Queryable status of the bootstrap, exposed by the status surface.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialSyncStatus {
    pub is_running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_report: Option<InitialSyncReport>,
    pub last_error: Option<String>,
}

// ============================================================================
// InitialSync
// ============================================================================

pub struct InitialSync {
    mapper: Arc<IdentityMapper>,
    host: Arc<dyn HostApp>,
    subscribed: Vec<String>,
    status: Mutex<InitialSyncStatus>,
}

impl InitialSync {
    pub fn new(mapper: Arc<IdentityMapper>, host: Arc<dyn HostApp>, subscribed: Vec<String>) -> Self {
        Self {
            mapper,
            host,
            subscribed,
            status: Mutex::new(InitialSyncStatus::default()),
        }
    }

    pub fn status(&self) -> InitialSyncStatus {
        self.status.lock().clone()
    }

    /// Run the bootstrap. Per-document failures are logged and counted; a
    /// page-level fetch failure skips the rest of that type and moves on.
    pub async fn run(&self, api: &dyn MasterApi, request: &InitialSyncRequest) -> Result<InitialSyncReport> {
        {
            let mut status = self.status.lock();
            if status.is_running {
                return Err(crate::error::SyncError::Config(
                    "initial sync already running".to_string(),
                ));
            }
            status.is_running = true;
            status.started_at = Some(Utc::now());
            status.finished_at = None;
            status.last_error = None;
        }

        let content_types: Vec<String> = match &request.content_types {
            Some(requested) => requested.clone(),
            None => self.subscribed.clone(),
        };
        info!(
            master_url = %request.master_url,
            dry_run = request.dry_run,
            types = content_types.len(),
            "starting initial sync"
        );

        let mut report = InitialSyncReport {
            dry_run: request.dry_run,
            ..Default::default()
        };
        for content_type in &content_types {
            let type_report = self.sync_type(api, content_type, request.dry_run).await;
            report.per_type.insert(content_type.clone(), type_report);
        }

        let mut status = self.status.lock();
        status.is_running = false;
        status.finished_at = Some(Utc::now());
        status.last_report = Some(report.clone());
        Ok(report)
    }

    async fn sync_type(&self, api: &dyn MasterApi, content_type: &str, dry_run: bool) -> TypeReport {
        let mut report = TypeReport::default();
        let mut page = 1;
        loop {
            let fetched = match api.list_documents(content_type, page, PAGE_SIZE).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(content_type, page, error = %e, "initial sync page fetch failed");
                    self.status.lock().last_error = Some(e.message);
                    break;
                }
            };
            for doc in &fetched.documents {
                report.fetched += 1;
                if dry_run {
                    continue;
                }
                match self.persist_document(content_type, doc).await {
                    Ok(created) => {
                        report.bound += 1;
                        if created {
                            report.created += 1;
                        }
                    }
                    Err(e) => {
                        report.failed += 1;
                        warn!(
                            content_type,
                            document_id = %doc.document_id,
                            error = %e,
                            "initial sync document failed"
                        );
                    }
                }
            }
            if !fetched.has_more {
                break;
            }
            page += 1;
        }
        report
    }

    /// Bind one document, creating the local copy on first sight. Returns
    /// whether a row was created (false = already present, copy refreshed).
    async fn persist_document(&self, content_type: &str, doc: &RemoteDocument) -> Result<bool> {
        match self.mapper.resolve(content_type, &doc.document_id)? {
            Some(local_id) => {
                self.host
                    .update(content_type, &local_id, &doc.payload, WriteOrigin::Sync)
                    .await?;
                // Idempotent re-bind keeps the mapping fresh.
                self.mapper.bind(content_type, &doc.document_id, &local_id)?;
                Ok(false)
            }
            None => {
                let record = self
                    .host
                    .create(content_type, &doc.document_id, &doc.payload, WriteOrigin::Sync)
                    .await?;
                self.mapper
                    .bind(content_type, &doc.document_id, &record.local_id)?;
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryHost;
    use crate::store::Db;
    use parking_lot::Mutex as PlMutex;
    use serde_json::json;

    /// Serves `total` documents per type, failing ids listed in `poison`.
    struct FakeMaster {
        total: usize,
        fail_pages_once: PlMutex<Vec<u32>>,
    }

    #[async_trait]
    impl MasterApi for FakeMaster {
        async fn list_documents(
            &self,
            _content_type: &str,
            page: u32,
            page_size: u32,
        ) -> std::result::Result<DocumentPage, TransportError> {
            if let Some(pos) = self.fail_pages_once.lock().iter().position(|p| *p == page) {
                self.fail_pages_once.lock().remove(pos);
                return Err(TransportError::transient("master unreachable"));
            }
            let start = ((page - 1) * page_size) as usize;
            let end = (start + page_size as usize).min(self.total);
            let documents = (start..end)
                .map(|i| RemoteDocument {
                    document_id: format!("d{i}"),
                    payload: json!({"title": format!("doc {i}")}),
                    version: 1,
                })
                .collect();
            Ok(DocumentPage {
                documents,
                has_more: end < self.total,
            })
        }
    }

    fn request(dry_run: bool) -> InitialSyncRequest {
        InitialSyncRequest {
            master_url: "http://master.example".into(),
            master_api_token: None,
            content_types: None,
            dry_run,
        }
    }

    fn bootstrap() -> (InitialSync, Arc<MemoryHost>, Arc<IdentityMapper>) {
        let db = Db::open_in_memory().expect("db");
        let host = MemoryHost::new();
        let mapper = Arc::new(IdentityMapper::new(db));
        let sync = InitialSync::new(
            Arc::clone(&mapper),
            Arc::clone(&host) as Arc<dyn HostApp>,
            vec!["api::page.page".into()],
        );
        (sync, host, mapper)
    }

    #[tokio::test]
    async fn bootstrap_paginates_binds_and_persists() {
        let (sync, host, mapper) = bootstrap();
        let master = FakeMaster {
            total: 250,
            fail_pages_once: PlMutex::new(vec![]),
        };
        let report = sync.run(&master, &request(false)).await.expect("run");
        let pages = &report.per_type["api::page.page"];
        assert_eq!(pages.fetched, 250);
        assert_eq!(pages.bound, 250);
        assert_eq!(pages.created, 250);
        assert_eq!(host.record_count(), 250);
        assert_eq!(mapper.count().expect("count"), 250);
        assert!(!sync.status().is_running);
    }

    #[tokio::test]
    async fn dry_run_counts_without_writing() {
        let (sync, host, mapper) = bootstrap();
        let master = FakeMaster {
            total: 10,
            fail_pages_once: PlMutex::new(vec![]),
        };
        let report = sync.run(&master, &request(true)).await.expect("run");
        assert_eq!(report.per_type["api::page.page"].fetched, 10);
        assert_eq!(report.per_type["api::page.page"].bound, 0);
        assert_eq!(host.record_count(), 0);
        assert_eq!(mapper.count().expect("count"), 0);
    }

    #[tokio::test]
    async fn reinvocation_resumes_idempotently() {
        let (sync, host, _mapper) = bootstrap();
        // First run dies on page 2: only the first hundred land.
        let master = FakeMaster {
            total: 150,
            fail_pages_once: PlMutex::new(vec![2]),
        };
        let first = sync.run(&master, &request(false)).await.expect("run");
        assert_eq!(first.per_type["api::page.page"].created, 100);

        // Second run sees every document; already-bound ones refresh in place.
        let second = sync.run(&master, &request(false)).await.expect("rerun");
        let report = &second.per_type["api::page.page"];
        assert_eq!(report.fetched, 150);
        assert_eq!(report.created, 50);
        assert_eq!(report.bound, 150);
        assert_eq!(host.record_count(), 150);
    }
}
