//! Remote collection abstraction.
//!
//! The [`IndexBackend`] trait is the narrow set of collection operations the
//! sync pipeline needs, enabling pluggable backends (Chroma over HTTP, an
//! in-memory collection for tests and dry embedding hosts).
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`ensure_ready`](IndexBackend::ensure_ready) | Resolve the collection before a batch |
//! | [`upsert`](IndexBackend::upsert) | Insert or replace records by id |
//! | [`delete_ids`](IndexBackend::delete_ids) | Delete records by id |
//! | [`delete_by_parent`](IndexBackend::delete_by_parent) | Delete every chunk of a document |
//! | [`list_records`](IndexBackend::list_records) | Ids and metadata of all records |
//! | [`count`](IndexBackend::count) | Number of records |
//!
//! Failures are [`SyncError::Executor`] values, classified as transient or
//! fatal from their message.

pub mod chroma;
pub mod memory;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::SyncError;

/// Metadata key linking a chunk record to its document.
pub const META_PARENT_ID: &str = "parent_id";

/// One record as sent to the collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexRecord {
    pub id: String,
    pub document: String,
    pub metadata: Map<String, Value>,
}

/// Id and metadata of a record already in the collection.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub id: String,
    pub metadata: Map<String, Value>,
}

impl RemoteRecord {
    /// Document this record belongs to: its `parent_id`, or itself.
    pub fn document_id(&self) -> &str {
        self.metadata
            .get(META_PARENT_ID)
            .and_then(Value::as_str)
            .unwrap_or(&self.id)
    }
}

#[async_trait]
pub trait IndexBackend: Send + Sync {
    /// Human-readable backend name for logs and status output.
    fn name(&self) -> &str;

    async fn ensure_ready(&self) -> Result<(), SyncError> {
        Ok(())
    }

    async fn upsert(&self, records: &[IndexRecord]) -> Result<(), SyncError>;

    async fn delete_ids(&self, ids: &[String]) -> Result<(), SyncError>;

    async fn delete_by_parent(&self, parent_id: &str) -> Result<(), SyncError>;

    async fn list_records(&self) -> Result<Vec<RemoteRecord>, SyncError>;

    async fn count(&self) -> Result<usize, SyncError>;
}
