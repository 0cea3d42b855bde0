//! In-memory [`IndexBackend`] for tests and offline runs.
//!
//! Records live in a `BTreeMap` behind `std::sync::RwLock`. Failures can be
//! injected per document (matched by record id or `parent_id`) or for every
//! call, to exercise retry and partial-failure paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use super::{IndexBackend, IndexRecord, RemoteRecord, META_PARENT_ID};
use crate::delta::document_id;
use crate::error::SyncError;

#[derive(Default)]
pub struct MemoryIndex {
    records: RwLock<BTreeMap<String, IndexRecord>>,
    /// Document id → error message.
    failures: RwLock<HashMap<String, String>>,
    fail_all: RwLock<Option<String>>,
}

fn poisoned() -> SyncError {
    SyncError::executor("in-memory index lock poisoned")
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, IndexRecord>>, SyncError> {
        self.records.read().map_err(|_| poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, IndexRecord>>, SyncError> {
        self.records.write().map_err(|_| poisoned())
    }

    /// Make every operation touching the document at `path` fail.
    pub fn fail_path(&self, path: &str, message: &str) {
        if let Ok(mut failures) = self.failures.write() {
            failures.insert(document_id(path), message.to_string());
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut failures) = self.failures.write() {
            failures.clear();
        }
        if let Ok(mut all) = self.fail_all.write() {
            *all = None;
        }
    }

    /// Make every operation fail, including `ensure_ready`.
    pub fn fail_all(&self, message: &str) {
        if let Ok(mut all) = self.fail_all.write() {
            *all = Some(message.to_string());
        }
    }

    /// Insert a record directly, bypassing failure injection.
    pub fn insert_raw(&self, record: IndexRecord) {
        if let Ok(mut records) = self.records.write() {
            records.insert(record.id.clone(), record);
        }
    }

    pub fn get(&self, id: &str) -> Option<IndexRecord> {
        self.records.read().ok()?.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.records
            .read()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn check(&self, doc_ids: &[&str]) -> Result<(), SyncError> {
        if let Some(message) = self.fail_all.read().map_err(|_| poisoned())?.as_ref() {
            return Err(SyncError::executor(message.clone()));
        }
        let failures = self.failures.read().map_err(|_| poisoned())?;
        for id in doc_ids {
            if let Some(message) = failures.get(*id) {
                return Err(SyncError::executor(message.clone()));
            }
        }
        Ok(())
    }
}

fn parent_of(record: &IndexRecord) -> &str {
    record
        .metadata
        .get(META_PARENT_ID)
        .and_then(|v| v.as_str())
        .unwrap_or(&record.id)
}

#[async_trait]
impl IndexBackend for MemoryIndex {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ensure_ready(&self) -> Result<(), SyncError> {
        self.check(&[])
    }

    async fn upsert(&self, records: &[IndexRecord]) -> Result<(), SyncError> {
        let parents: Vec<&str> = records.iter().map(parent_of).collect();
        self.check(&parents)?;
        let mut stored = self.write()?;
        for record in records {
            stored.insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    async fn delete_ids(&self, ids: &[String]) -> Result<(), SyncError> {
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        self.check(&refs)?;
        let mut stored = self.write()?;
        for id in ids {
            stored.remove(id);
        }
        Ok(())
    }

    async fn delete_by_parent(&self, parent_id: &str) -> Result<(), SyncError> {
        self.check(&[parent_id])?;
        let mut stored = self.write()?;
        stored.retain(|_, r| {
            r.metadata.get(META_PARENT_ID).and_then(|v| v.as_str()) != Some(parent_id)
        });
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<RemoteRecord>, SyncError> {
        self.check(&[])?;
        Ok(self
            .read()?
            .values()
            .map(|r| RemoteRecord {
                id: r.id.clone(),
                metadata: r.metadata.clone(),
            })
            .collect())
    }

    async fn count(&self) -> Result<usize, SyncError> {
        self.check(&[])?;
        Ok(self.read()?.len())
    }
}
