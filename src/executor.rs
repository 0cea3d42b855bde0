//! Batch executor: applies planned [`DeltaAction`]s to an [`IndexBackend`].
//!
//! Each upsert becomes one record, or one record per chunk when its text
//! exceeds the chunking limit. Chunk records carry `parent_id` so that a
//! later upsert or delete of the document can remove its stale chunks.
//!
//! The executor checks the cancellation token between actions and reports
//! how many actions of the batch it handled. A failing action is recorded
//! and the batch continues; only a backend that cannot be reached at all
//! fails the whole batch.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chunk::{chunk_document, needs_chunking};
use crate::config::ChunkingConfig;
use crate::error::{RecordedError, SyncError};
use crate::index::{IndexBackend, IndexRecord, META_PARENT_ID};
use crate::models::{DeltaAction, MimeClass, SourceDocument, META_MTIME, META_PATH};

/// Result of one executed batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Actions handled, counted from the front of the batch.
    pub processed: usize,
    pub errors: Vec<RecordedError>,
    /// Ids of handled actions that failed.
    pub failed_ids: Vec<String>,
}

impl BatchOutcome {
    /// Every action of `batch` handled and failed with the same `error`.
    pub fn failed(batch: &[DeltaAction], error: &SyncError) -> Self {
        Self {
            processed: batch.len(),
            errors: vec![RecordedError::for_batch(error)],
            failed_ids: batch.iter().map(|a| a.id().to_string()).collect(),
        }
    }
}

#[async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn execute(
        &self,
        batch: &[DeltaAction],
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome, SyncError>;
}

/// Keep scalar metadata; drop nulls and stringify arrays and objects.
pub fn clean_metadata(metadata: &Map<String, Value>) -> Map<String, Value> {
    metadata
        .iter()
        .filter_map(|(k, v)| {
            let cleaned = match v {
                Value::Null => return None,
                Value::String(_) | Value::Number(_) | Value::Bool(_) => v.clone(),
                Value::Array(_) | Value::Object(_) => Value::String(v.to_string()),
            };
            Some((k.clone(), cleaned))
        })
        .collect()
}

/// Records for one upsert: the document itself, or its chunks.
pub fn plan_records(
    id: &str,
    text: &str,
    metadata: &Map<String, Value>,
    chunking: &ChunkingConfig,
) -> Vec<IndexRecord> {
    let base = clean_metadata(metadata);
    if !needs_chunking(text, chunking) {
        return vec![IndexRecord {
            id: id.to_string(),
            document: text.to_string(),
            metadata: base,
        }];
    }

    let mime = metadata
        .get("extension")
        .and_then(Value::as_str)
        .map(MimeClass::from_extension)
        .unwrap_or(MimeClass::Text);
    let doc = SourceDocument {
        id: id.to_string(),
        mime,
        content: text.to_string(),
        updated_at: metadata.get(META_MTIME).and_then(Value::as_i64).unwrap_or(0),
    };

    let chunks: Vec<_> = chunk_document(&doc, chunking).collect();
    if chunks.is_empty() {
        return vec![IndexRecord {
            id: id.to_string(),
            document: text.to_string(),
            metadata: base,
        }];
    }

    let total = chunks.len();
    chunks
        .into_iter()
        .map(|chunk| {
            let mut m = base.clone();
            m.insert(META_PARENT_ID.into(), Value::String(id.to_string()));
            m.insert("is_chunk".into(), Value::Bool(true));
            m.insert("chunk_index".into(), Value::from(chunk.metadata.sequence_order));
            m.insert("total_chunks".into(), Value::from(total));
            m.insert("overlap_with_prev".into(), Value::Bool(chunk.metadata.overlap_with_prev));
            m.insert("overlap_with_next".into(), Value::Bool(chunk.metadata.overlap_with_next));
            m.insert("chunk_start".into(), Value::from(chunk.start));
            m.insert("chunk_end".into(), Value::from(chunk.end));
            m.insert("content_hash".into(), Value::String(chunk.content_hash.clone()));
            if !chunk.metadata.heading_breadcrumbs.is_empty() {
                m.insert(
                    "heading_path".into(),
                    Value::String(chunk.metadata.heading_breadcrumbs.join(" > ")),
                );
            }
            IndexRecord {
                id: chunk.id,
                document: chunk.content,
                metadata: m,
            }
        })
        .collect()
}

/// [`BatchExecutor`] over any [`IndexBackend`].
pub struct IndexExecutor {
    backend: Arc<dyn IndexBackend>,
    chunking: ChunkingConfig,
}

impl IndexExecutor {
    pub fn new(backend: Arc<dyn IndexBackend>, chunking: ChunkingConfig) -> Self {
        Self { backend, chunking }
    }

    async fn apply(&self, action: &DeltaAction) -> Result<(), SyncError> {
        match action {
            DeltaAction::Upsert {
                id, text, metadata, ..
            } => {
                let records = plan_records(id, text, metadata, &self.chunking);
                let chunked = records.first().is_some_and(|r| r.id != *id);
                // Chunks from an earlier, longer version of the document.
                self.backend.delete_by_parent(id).await?;
                if chunked {
                    self.backend.delete_ids(std::slice::from_ref(id)).await?;
                }
                debug!(
                    id = %id,
                    path = ?metadata.get(META_PATH),
                    records = records.len(),
                    "Upserting document"
                );
                self.backend.upsert(&records).await
            }
            DeltaAction::Delete { id, path } => {
                debug!(id = %id, path = %path, "Deleting document");
                self.backend.delete_ids(std::slice::from_ref(id)).await?;
                self.backend.delete_by_parent(id).await
            }
        }
    }
}

#[async_trait]
impl BatchExecutor for IndexExecutor {
    async fn execute(
        &self,
        batch: &[DeltaAction],
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome, SyncError> {
        self.backend.ensure_ready().await?;

        let mut outcome = BatchOutcome::default();
        for action in batch {
            if cancel.is_cancelled() {
                debug!(processed = outcome.processed, "Batch cancelled");
                break;
            }
            if let Err(e) = self.apply(action).await {
                warn!(path = %action.path(), error = %e, "Action failed");
                outcome.errors.push(RecordedError::for_path(action.path(), &e));
                outcome.failed_ids.push(action.id().to_string());
            }
            outcome.processed += 1;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::memory::MemoryIndex;
    use serde_json::json;

    fn config() -> ChunkingConfig {
        ChunkingConfig {
            max_len: 200,
            target_len: 150,
            overlap_len: 20,
        }
    }

    fn upsert(path: &str, text: &str) -> DeltaAction {
        let metadata = json!({ "path": path, "extension": "md", "mtime": 7, "tags": ["a"], "gone": null });
        DeltaAction::Upsert {
            id: crate::delta::document_id(path),
            path: path.into(),
            text: text.into(),
            metadata: metadata.as_object().cloned().unwrap(),
        }
    }

    fn long_text() -> String {
        (0..20)
            .map(|i| format!("Sentence number {i} is here. Another follows."))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    #[test]
    fn clean_metadata_keeps_scalars() {
        let m = json!({ "s": "x", "n": 1, "b": true, "null": null, "arr": [1, 2], "obj": {"k": 1} });
        let cleaned = clean_metadata(m.as_object().unwrap());
        assert_eq!(cleaned["s"], "x");
        assert_eq!(cleaned["n"], 1);
        assert_eq!(cleaned["b"], true);
        assert!(!cleaned.contains_key("null"));
        assert_eq!(cleaned["arr"], "[1,2]");
        assert_eq!(cleaned["obj"], "{\"k\":1}");
    }

    #[test]
    fn long_text_becomes_linked_chunks() {
        let action = upsert("big.md", &long_text());
        let DeltaAction::Upsert { id, text, metadata, .. } = &action else {
            unreachable!()
        };
        let records = plan_records(id, text, metadata, &config());
        assert!(records.len() > 1);
        for (i, r) in records.iter().enumerate() {
            assert!(r.id.starts_with(&format!("{id}:")));
            assert!(r.id.len() <= 122);
            assert_eq!(r.metadata["parent_id"], id.as_str());
            assert_eq!(r.metadata["chunk_index"], i);
            assert_eq!(r.metadata["total_chunks"], records.len());
            assert_eq!(r.metadata["tags"], "[\"a\"]");
        }
    }

    #[tokio::test]
    async fn upsert_replaces_stale_chunks() {
        let index = Arc::new(MemoryIndex::new());
        let exec = IndexExecutor::new(index.clone(), config());
        let token = CancellationToken::new();

        exec.execute(&[upsert("big.md", &long_text())], &token)
            .await
            .unwrap();
        assert!(index.ids().len() > 1);

        let outcome = exec
            .execute(&[upsert("big.md", "short now")], &token)
            .await
            .unwrap();
        assert_eq!(outcome.processed, 1);
        assert_eq!(index.ids(), vec![crate::delta::document_id("big.md")]);
    }

    #[tokio::test]
    async fn delete_removes_document_and_chunks() {
        let index = Arc::new(MemoryIndex::new());
        let exec = IndexExecutor::new(index.clone(), config());
        let token = CancellationToken::new();
        exec.execute(&[upsert("big.md", &long_text()), upsert("a.md", "a")], &token)
            .await
            .unwrap();

        let delete = DeltaAction::Delete {
            id: crate::delta::document_id("big.md"),
            path: "big.md".into(),
        };
        exec.execute(&[delete], &token).await.unwrap();
        assert_eq!(index.ids(), vec![crate::delta::document_id("a.md")]);
    }

    #[tokio::test]
    async fn failing_action_is_recorded_and_batch_continues() {
        let index = Arc::new(MemoryIndex::new());
        index.fail_path("b.md", "Quota exceeded");
        let exec = IndexExecutor::new(index.clone(), config());
        let batch = vec![upsert("a.md", "a"), upsert("b.md", "b"), upsert("c.md", "c")];

        let outcome = exec.execute(&batch, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.processed, 3);
        assert_eq!(outcome.failed_ids, vec![crate::delta::document_id("b.md")]);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].message.contains("Quota exceeded"));
        assert_eq!(outcome.errors[0].path.as_deref(), Some("b.md"));
        assert_eq!(outcome.errors[0].class, crate::error::ErrorClass::Transient);
        assert_eq!(index.ids().len(), 2);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_next_action() {
        let index = Arc::new(MemoryIndex::new());
        let exec = IndexExecutor::new(index.clone(), config());
        let token = CancellationToken::new();
        token.cancel();
        let outcome = exec.execute(&[upsert("a.md", "a")], &token).await.unwrap();
        assert_eq!(outcome.processed, 0);
        assert!(index.ids().is_empty());
    }

    #[tokio::test]
    async fn unreachable_backend_fails_the_batch() {
        let index = Arc::new(MemoryIndex::new());
        index.fail_all("connection refused");
        let exec = IndexExecutor::new(index, config());
        let result = exec.execute(&[upsert("a.md", "a")], &CancellationToken::new()).await;
        assert!(result.is_err());
    }
}
