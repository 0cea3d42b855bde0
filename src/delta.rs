//! Delta engine: fingerprints the vault, diffs against the last known
//! [`FileState`], and emits the minimal ordered [`DeltaPlan`].
//!
//! Also owns the retry and verification bookkeeping that is layered onto a
//! persisted `FileState` between syncs.
//!
//! # Plan order
//!
//! Actions follow discovery order: every current path in scan order (sorted
//! by path), then every vanished path in previous-state order. Upserts and
//! deletes are not regrouped by type.

use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use chrono::Utc;
use indexmap::IndexSet;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::VaultConfig;
use crate::error::SyncError;
use crate::extract::ProcessorRegistry;
use crate::models::{
    ChromaVerification, DeltaAction, DeltaPlan, FileFingerprint, FileState, Inconsistencies,
    PartialSync, VerificationStatus, META_HASH, META_MTIME, META_PATH, META_SIZE,
};
use crate::source::{DocumentEntry, DocumentSource, FsSource, PathFilter};

/// Default retry budget for a failed document.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Sanitized path bytes kept in a document id. With the `-` and the 12-char
/// path digest the id stays at most 109 bytes, leaving room for a chunk
/// suffix under the remote's 128-byte id limit.
const MAX_ID_PATH_BYTES: usize = 96;
const ID_DIGEST_CHARS: usize = 12;

/// SHA-256 of `bytes`, lowercase hex.
pub fn hash_content(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Remote id for the document at `path`.
///
/// Characters other than alphanumerics, `.`, `-` and `_` become `_`; the
/// result is truncated on a char boundary and suffixed with a digest of the
/// exact path, so ids stay unique even when sanitizing or truncating folds
/// two paths together.
pub fn document_id(path: &str) -> String {
    let sanitized: String = path
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut cut = sanitized.len().min(MAX_ID_PATH_BYTES);
    while !sanitized.is_char_boundary(cut) {
        cut -= 1;
    }
    let digest = hash_content(path.as_bytes());
    format!("{}-{}", &sanitized[..cut], &digest[..ID_DIGEST_CHARS])
}

fn file_type(ext: &str) -> &'static str {
    match ext {
        "md" | "markdown" => "markdown",
        "pdf" => "pdf",
        "png" | "jpg" | "jpeg" | "gif" | "bmp" | "tiff" | "tif" | "webp" => "image",
        _ => "text",
    }
}

pub struct DeltaEngine {
    source: Box<dyn DocumentSource>,
    filter: PathFilter,
    processors: ProcessorRegistry,
    current: BTreeMap<String, FileFingerprint>,
}

impl DeltaEngine {
    pub fn new(source: Box<dyn DocumentSource>, filter: PathFilter) -> Self {
        Self {
            source,
            filter,
            processors: ProcessorRegistry::default(),
            current: BTreeMap::new(),
        }
    }

    /// Engine over the configured vault directory.
    pub fn from_config(vault: &VaultConfig) -> Result<Self, SyncError> {
        let filter = PathFilter::new(&vault.include_globs, &vault.effective_excludes())?;
        let source = FsSource::new(&vault.root, vault.follow_symlinks);
        Ok(Self::new(Box::new(source), filter))
    }

    pub fn with_processors(mut self, processors: ProcessorRegistry) -> Self {
        self.processors = processors;
        self
    }

    /// Fingerprint every included document. Unreadable documents are logged
    /// and left out; only a failure to list the collection is an error.
    pub fn scan(&mut self) -> Result<&BTreeMap<String, FileFingerprint>> {
        let entries = self.source.list()?;
        let mut current = BTreeMap::new();

        for entry in entries {
            if !self.filter.is_match(&entry.path) {
                continue;
            }
            match self.source.read(&entry.path) {
                Ok(bytes) => {
                    let fp = FileFingerprint {
                        path: entry.path.clone(),
                        hash: hash_content(&bytes),
                        mtime: entry.mtime,
                        size: entry.size,
                    };
                    current.insert(entry.path, fp);
                }
                Err(e) => {
                    let err = SyncError::Scan {
                        path: entry.path.clone(),
                        message: e.to_string(),
                    };
                    warn!(error = %err, "Excluding document from scan");
                }
            }
        }

        debug!(documents = current.len(), "Scan complete");
        self.current = current;
        Ok(&self.current)
    }

    /// Fingerprints from the last [`scan`](Self::scan).
    pub fn current(&self) -> &BTreeMap<String, FileFingerprint> {
        &self.current
    }

    pub fn diff(&self, previous: Option<&FileState>) -> DeltaPlan {
        let mut plan = DeltaPlan::default();

        for (path, fp) in &self.current {
            let prev = previous.and_then(|p| p.files.get(path));
            let is_new = match prev {
                None => true,
                Some(prev) if prev.hash != fp.hash => false,
                Some(_) => {
                    plan.stats.unchanged += 1;
                    continue;
                }
            };
            match self.upsert_for(fp) {
                Ok(action) => {
                    plan.actions.push(action);
                    if is_new {
                        plan.stats.added += 1;
                    } else {
                        plan.stats.updated += 1;
                    }
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Skipping document that could not be read");
                    plan.skipped.push(path.clone());
                }
            }
        }

        if let Some(previous) = previous {
            for path in previous.files.keys() {
                if !self.current.contains_key(path) {
                    plan.actions.push(DeltaAction::Delete {
                        id: document_id(path),
                        path: path.clone(),
                    });
                    plan.stats.deleted += 1;
                }
            }
        }

        plan
    }

    /// Re-plan documents an earlier sync failed on, unless the diff already
    /// covers them. Present documents are re-upserted, vanished ones deleted.
    pub fn add_retries(&self, plan: &mut DeltaPlan, paths: &[String]) {
        let planned: HashSet<String> = plan
            .actions
            .iter()
            .map(|a| a.path().to_string())
            .chain(plan.skipped.iter().cloned())
            .collect();

        for path in paths {
            if planned.contains(path) {
                continue;
            }
            match self.current.get(path) {
                Some(fp) => match self.upsert_for(fp) {
                    Ok(action) => {
                        plan.actions.push(action);
                        plan.stats.retried += 1;
                        plan.stats.unchanged = plan.stats.unchanged.saturating_sub(1);
                    }
                    Err(e) => {
                        warn!(path = %path, error = %e, "Skipping retry of unreadable document");
                        plan.skipped.push(path.clone());
                    }
                },
                None => {
                    plan.actions.push(DeltaAction::Delete {
                        id: document_id(path),
                        path: path.clone(),
                    });
                    plan.stats.retried += 1;
                }
            }
        }
    }

    /// FileState of the last scan, stamped now.
    pub fn snapshot(&self) -> FileState {
        FileState::new(self.current.clone())
    }

    fn upsert_for(&self, fp: &FileFingerprint) -> Result<DeltaAction> {
        let bytes = self.source.read(&fp.path)?;
        let entry = DocumentEntry {
            path: fp.path.clone(),
            mtime: fp.mtime,
            size: fp.size,
        };
        let processed = self.processors.process(&entry, &bytes);
        let ext = entry.extension();

        let mut metadata: Map<String, Value> = processed.metadata;
        metadata.insert(META_PATH.into(), Value::String(fp.path.clone()));
        metadata.insert(META_HASH.into(), Value::String(fp.hash.clone()));
        metadata.insert(META_MTIME.into(), Value::from(fp.mtime));
        metadata.insert(META_SIZE.into(), Value::from(fp.size));
        metadata.insert("type".into(), Value::String(file_type(&ext).to_string()));
        metadata.insert("extension".into(), Value::String(ext));

        Ok(DeltaAction::Upsert {
            id: document_id(&fp.path),
            path: fp.path.clone(),
            text: processed.content,
            metadata,
        })
    }
}

/// Equal iff both states track the same paths with the same hash and mtime.
pub fn states_equal(a: &FileState, b: &FileState) -> bool {
    a.files.len() == b.files.len()
        && a.files.iter().all(|(path, fa)| {
            b.files
                .get(path)
                .is_some_and(|fb| fa.hash == fb.hash && fa.mtime == fb.mtime)
        })
}

/// Record one more failed attempt for each of `paths`.
pub fn mark_failed(state: &mut FileState, paths: &[String]) {
    if paths.is_empty() {
        return;
    }
    let now = Utc::now();
    let partial = state.partial_sync.get_or_insert_with(|| PartialSync {
        failed_files: IndexSet::new(),
        retry_count: BTreeMap::new(),
        last_failure_time: now,
    });

    let mut seen = HashSet::new();
    for path in paths {
        if !seen.insert(path.as_str()) {
            continue;
        }
        partial.failed_files.insert(path.clone());
        *partial.retry_count.entry(path.clone()).or_insert(0) += 1;
    }
    partial.last_failure_time = now;
}

/// Forget failures for `paths`; an emptied record collapses to `None`.
pub fn mark_succeeded(state: &mut FileState, paths: &[String]) {
    let Some(partial) = state.partial_sync.as_mut() else {
        return;
    };
    for path in paths {
        partial.failed_files.shift_remove(path);
        partial.retry_count.remove(path);
    }
    if partial.failed_files.is_empty() {
        state.partial_sync = None;
    }
}

/// Failed paths still within the retry budget, in failure order.
pub fn retryable_files(state: &FileState, max_retries: u32) -> Vec<String> {
    let Some(partial) = &state.partial_sync else {
        return Vec::new();
    };
    partial
        .failed_files
        .iter()
        .filter(|path| partial.retry_count.get(*path).copied().unwrap_or(0) < max_retries)
        .cloned()
        .collect()
}

/// Failed paths whose retry budget is spent, in failure order.
pub fn exhausted_files(state: &FileState, max_retries: u32) -> Vec<String> {
    let Some(partial) = &state.partial_sync else {
        return Vec::new();
    };
    partial
        .failed_files
        .iter()
        .filter(|path| partial.retry_count.get(*path).copied().unwrap_or(0) >= max_retries)
        .cloned()
        .collect()
}

pub fn needs_verification(state: &FileState, max_age: chrono::Duration) -> bool {
    match &state.chroma_verification {
        None => true,
        Some(v) => Utc::now() - v.last_verification_time > max_age,
    }
}

/// Replace the verification record. Inconsistencies, when given, are
/// stamped with the current time.
pub fn update_verification(
    state: &mut FileState,
    status: VerificationStatus,
    inconsistencies: Option<Inconsistencies>,
) {
    let now = Utc::now();
    state.chroma_verification = Some(ChromaVerification {
        last_verification_time: now,
        status,
        inconsistencies: inconsistencies.map(|mut i| {
            i.last_checked_time = now;
            i
        }),
    });
}
