//! Core data models shared by the delta engine, chunker, session and
//! orchestrator.
//!
//! Everything that is persisted derives `Serialize`/`Deserialize`; set-like
//! fields are [`IndexSet`]s in memory and plain JSON lists on disk.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current on-disk version of [`FileState`].
pub const SCHEMA_VERSION: u32 = 1;

/// Metadata keys written on every upsert and read back by
/// [`FileFingerprint::from_metadata`].
pub const META_PATH: &str = "path";
pub const META_HASH: &str = "hash";
pub const META_MTIME: &str = "mtime";
pub const META_SIZE: &str = "size";

/// Snapshot of one document at scan time. The hash decides change; mtime and
/// size are diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub path: String,
    /// SHA-256 of the raw content, lowercase hex.
    pub hash: String,
    /// Modification time, milliseconds since the Unix epoch.
    pub mtime: i64,
    pub size: u64,
}

impl FileFingerprint {
    /// Rebuild a fingerprint from upsert metadata, if all fields are present.
    pub fn from_metadata(metadata: &Map<String, Value>) -> Option<Self> {
        Some(Self {
            path: metadata.get(META_PATH)?.as_str()?.to_string(),
            hash: metadata.get(META_HASH)?.as_str()?.to_string(),
            mtime: metadata.get(META_MTIME)?.as_i64()?,
            size: metadata.get(META_SIZE)?.as_u64()?,
        })
    }
}

/// Last known state of the vault as it was pushed to the remote collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileState {
    pub files: BTreeMap<String, FileFingerprint>,
    pub last_sync_time: DateTime<Utc>,
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_sync: Option<PartialSync>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chroma_verification: Option<ChromaVerification>,
}

impl FileState {
    pub fn new(files: BTreeMap<String, FileFingerprint>) -> Self {
        Self {
            files,
            last_sync_time: Utc::now(),
            schema_version: SCHEMA_VERSION,
            partial_sync: None,
            chroma_verification: None,
        }
    }

    pub fn empty() -> Self {
        Self::new(BTreeMap::new())
    }

    /// Fold actions that reached the remote into this state: upserts record
    /// the fingerprint carried in their metadata, deletes drop the path.
    pub fn apply_actions<'a>(&mut self, actions: impl IntoIterator<Item = &'a DeltaAction>) {
        for action in actions {
            match action {
                DeltaAction::Upsert { path, metadata, .. } => {
                    if let Some(fp) = FileFingerprint::from_metadata(metadata) {
                        self.files.insert(path.clone(), fp);
                    }
                }
                DeltaAction::Delete { path, .. } => {
                    self.files.remove(path);
                }
            }
        }
        self.last_sync_time = Utc::now();
    }
}

/// Retry bookkeeping for documents that did not make it to the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialSync {
    pub failed_files: IndexSet<String>,
    pub retry_count: BTreeMap<String, u32>,
    pub last_failure_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Pending,
    Verified,
    Inconsistent,
}

impl std::fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VerificationStatus::Pending => "pending",
            VerificationStatus::Verified => "verified",
            VerificationStatus::Inconsistent => "inconsistent",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inconsistencies {
    pub missing_remotely: BTreeSet<String>,
    pub extra_remotely: BTreeSet<String>,
    pub last_checked_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChromaVerification {
    pub last_verification_time: DateTime<Utc>,
    pub status: VerificationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inconsistencies: Option<Inconsistencies>,
}

/// One operation against the remote collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum DeltaAction {
    Upsert {
        id: String,
        path: String,
        text: String,
        metadata: Map<String, Value>,
    },
    Delete {
        id: String,
        path: String,
    },
}

impl DeltaAction {
    pub fn id(&self) -> &str {
        match self {
            DeltaAction::Upsert { id, .. } | DeltaAction::Delete { id, .. } => id,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            DeltaAction::Upsert { path, .. } | DeltaAction::Delete { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeltaStats {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    /// Unchanged documents re-sent because an earlier sync failed on them.
    pub retried: usize,
}

impl DeltaStats {
    pub fn total_actions(&self) -> usize {
        self.added + self.updated + self.deleted + self.retried
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeltaPlan {
    pub actions: Vec<DeltaAction>,
    pub stats: DeltaStats,
    /// Scanned documents whose content could not be read while planning.
    pub skipped: Vec<String>,
}

impl DeltaPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// How a document's text is structured, which picks the tokenizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MimeClass {
    Markdown,
    Text,
    Pdf,
}

impl MimeClass {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "md" | "markdown" => MimeClass::Markdown,
            "pdf" => MimeClass::Pdf,
            _ => MimeClass::Text,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MimeClass::Markdown => "markdown",
            MimeClass::Text => "text",
            MimeClass::Pdf => "pdf",
        }
    }
}

/// A document handed to the chunker.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub id: String,
    pub mime: MimeClass,
    pub content: String,
    /// Milliseconds since the Unix epoch.
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkMetadata {
    pub overlap_with_prev: bool,
    pub overlap_with_next: bool,
    pub mime: MimeClass,
    pub heading_breadcrumbs: Vec<String>,
    pub sequence_order: usize,
    pub updated_at: i64,
}

/// A bounded slice of a [`SourceDocument`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentChunk {
    /// `"{parent_id}:{12 hex chars of content_hash}"`.
    pub id: String,
    pub parent_id: String,
    /// Overlap prefix followed by this chunk's own text.
    pub content: String,
    /// Byte offsets of the chunk's own text in the parent content.
    pub start: usize,
    pub end: usize,
    pub content_hash: String,
    pub metadata: ChunkMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upsert(path: &str, hash: &str) -> DeltaAction {
        let metadata = json!({ "path": path, "hash": hash, "mtime": 5, "size": 10 });
        DeltaAction::Upsert {
            id: path.to_string(),
            path: path.to_string(),
            text: String::new(),
            metadata: metadata.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn delta_action_serializes_tagged() {
        let action = DeltaAction::Delete {
            id: "a".into(),
            path: "a.md".into(),
        };
        let v = serde_json::to_value(&action).unwrap();
        assert_eq!(v["action"], "delete");
        let back: DeltaAction = serde_json::from_value(v).unwrap();
        assert_eq!(back, action);
    }

    #[test]
    fn apply_actions_records_upserts_and_deletes() {
        let mut state = FileState::empty();
        state.apply_actions(&[upsert("a.md", "h1"), upsert("b.md", "h2")]);
        assert_eq!(state.files.len(), 2);
        assert_eq!(state.files["a.md"].hash, "h1");

        state.apply_actions(&[DeltaAction::Delete {
            id: "a".into(),
            path: "a.md".into(),
        }]);
        assert!(!state.files.contains_key("a.md"));
        assert_eq!(state.files["b.md"].size, 10);
    }

    #[test]
    fn absent_optional_records_are_not_serialized() {
        let state = FileState::empty();
        let v = serde_json::to_value(&state).unwrap();
        assert!(v.get("partial_sync").is_none());
        assert!(v.get("chroma_verification").is_none());
        assert_eq!(v["schema_version"], 1);
    }

    #[test]
    fn mime_class_from_extension() {
        assert_eq!(MimeClass::from_extension("MD"), MimeClass::Markdown);
        assert_eq!(MimeClass::from_extension("pdf"), MimeClass::Pdf);
        assert_eq!(MimeClass::from_extension("txt"), MimeClass::Text);
    }
}
