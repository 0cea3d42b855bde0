//! Reconciliation between the persisted file state and the remote collection.
//!
//! Verification compares the paths recorded in `file_state.json` with the
//! documents present remotely. Chunk records count toward their parent
//! document. The result is recorded in the file state as `verified` or
//! `inconsistent`; the sync session is never touched.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::delta::{document_id, update_verification};
use crate::error::SyncError;
use crate::index::IndexBackend;
use crate::models::{FileFingerprint, FileState, Inconsistencies, VerificationStatus, META_PATH};
use crate::store::StateStore;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MembershipReport {
    /// Local paths with no remote document.
    pub missing_remotely: BTreeSet<String>,
    /// Remote documents with no local path, by `path` metadata or id.
    pub extra_remotely: BTreeSet<String>,
    pub local_count: usize,
    /// Distinct remote documents.
    pub remote_count: usize,
    /// Raw record count of the collection, chunks included.
    pub collection_count: usize,
}

impl MembershipReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_remotely.is_empty() && self.extra_remotely.is_empty()
    }
}

#[async_trait]
pub trait VerificationBackend: Send + Sync {
    async fn membership(
        &self,
        local: &BTreeMap<String, FileFingerprint>,
    ) -> Result<MembershipReport, SyncError>;
}

#[async_trait]
impl<T: IndexBackend + ?Sized> VerificationBackend for T {
    async fn membership(
        &self,
        local: &BTreeMap<String, FileFingerprint>,
    ) -> Result<MembershipReport, SyncError> {
        let records = self.list_records().await?;
        let collection_count = self.count().await?;

        // document id → reported name
        let mut remote: HashMap<String, String> = HashMap::new();
        for record in &records {
            let doc = record.document_id().to_string();
            let name = record
                .metadata
                .get(META_PATH)
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| doc.clone());
            remote.entry(doc).or_insert(name);
        }

        let local_ids: HashMap<String, &str> = local
            .keys()
            .map(|path| (document_id(path), path.as_str()))
            .collect();

        let missing_remotely = local_ids
            .iter()
            .filter(|(id, _)| !remote.contains_key(*id))
            .map(|(_, path)| path.to_string())
            .collect();
        let extra_remotely = remote
            .iter()
            .filter(|(id, _)| !local_ids.contains_key(*id))
            .map(|(_, name)| name.clone())
            .collect();

        Ok(MembershipReport {
            missing_remotely,
            extra_remotely,
            local_count: local.len(),
            remote_count: remote.len(),
            collection_count,
        })
    }
}

/// Verify the persisted file state against `backend` and record the result.
pub async fn run_verification(
    backend: &dyn VerificationBackend,
    store: &StateStore,
) -> Result<MembershipReport, SyncError> {
    let mut state = store.load_file_state().unwrap_or_else(FileState::empty);
    let report = backend.membership(&state.files).await?;

    if report.is_consistent() {
        info!(
            documents = report.local_count,
            records = report.collection_count,
            "Remote collection verified"
        );
        update_verification(&mut state, VerificationStatus::Verified, None);
    } else {
        warn!(
            missing = report.missing_remotely.len(),
            extra = report.extra_remotely.len(),
            "Remote collection is inconsistent with local state"
        );
        let inconsistencies = Inconsistencies {
            missing_remotely: report.missing_remotely.clone(),
            extra_remotely: report.extra_remotely.clone(),
            last_checked_time: chrono::Utc::now(),
        };
        update_verification(
            &mut state,
            VerificationStatus::Inconsistent,
            Some(inconsistencies),
        );
    }

    if let Err(e) = store.save_file_state(&state) {
        warn!(error = %e, "Failed to persist verification result");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::memory::MemoryIndex;
    use crate::index::{IndexRecord, META_PARENT_ID};
    use serde_json::Map;
    use tempfile::TempDir;

    fn fp(path: &str) -> FileFingerprint {
        FileFingerprint {
            path: path.into(),
            hash: "h".into(),
            mtime: 0,
            size: 0,
        }
    }

    fn record(path: &str, chunk: Option<usize>) -> IndexRecord {
        let doc = document_id(path);
        let mut metadata = Map::new();
        metadata.insert(META_PATH.into(), Value::String(path.into()));
        let id = match chunk {
            Some(i) => {
                metadata.insert(META_PARENT_ID.into(), Value::String(doc.clone()));
                format!("{doc}:{i:012}")
            }
            None => doc,
        };
        IndexRecord {
            id,
            document: String::new(),
            metadata,
        }
    }

    fn state(paths: &[&str]) -> FileState {
        FileState::new(paths.iter().map(|p| (p.to_string(), fp(p))).collect())
    }

    #[tokio::test]
    async fn chunks_count_toward_their_document() {
        let index = MemoryIndex::new();
        index.insert_raw(record("a.md", None));
        index.insert_raw(record("big.md", Some(0)));
        index.insert_raw(record("big.md", Some(1)));

        let report = index.membership(&state(&["a.md", "big.md"]).files).await.unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.local_count, 2);
        assert_eq!(report.remote_count, 2);
        assert_eq!(report.collection_count, 3);
    }

    #[tokio::test]
    async fn reports_missing_and_extra_by_path() {
        let index = MemoryIndex::new();
        index.insert_raw(record("a.md", None));
        index.insert_raw(record("stale.md", None));

        let report = index.membership(&state(&["a.md", "b.md"]).files).await.unwrap();
        assert_eq!(report.missing_remotely, BTreeSet::from(["b.md".to_string()]));
        assert_eq!(report.extra_remotely, BTreeSet::from(["stale.md".to_string()]));
    }

    #[tokio::test]
    async fn run_verification_records_status() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());
        store.save_file_state(&state(&["a.md", "b.md"])).unwrap();
        let index = MemoryIndex::new();
        index.insert_raw(record("a.md", None));

        let report = run_verification(&index, &store).await.unwrap();
        assert!(!report.is_consistent());
        let saved = store.load_file_state().unwrap();
        let v = saved.chroma_verification.unwrap();
        assert_eq!(v.status, VerificationStatus::Inconsistent);
        assert!(v.inconsistencies.unwrap().missing_remotely.contains("b.md"));

        index.insert_raw(record("b.md", None));
        run_verification(&index, &store).await.unwrap();
        let v = store.load_file_state().unwrap().chroma_verification.unwrap();
        assert_eq!(v.status, VerificationStatus::Verified);
        assert!(v.inconsistencies.is_none());
    }

    #[tokio::test]
    async fn backend_failure_leaves_state_untouched() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());
        store.save_file_state(&state(&["a.md"])).unwrap();
        let index = MemoryIndex::new();
        index.fail_all("503 Service Unavailable");

        assert!(run_verification(&index, &store).await.is_err());
        assert!(store.load_file_state().unwrap().chroma_verification.is_none());
    }
}
