//! Document sources and path filtering.
//!
//! A [`DocumentSource`] enumerates documents and reads their bytes; the
//! [`PathFilter`] decides which of them belong to the vault. Failures on a
//! single document are the caller's to absorb, so `list` reports per-entry
//! problems as warnings and keeps going.

use anyhow::{bail, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::warn;
use walkdir::WalkDir;

use crate::error::SyncError;

/// A listed document: vault-relative path plus auxiliary stat data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentEntry {
    pub path: String,
    /// Milliseconds since the Unix epoch.
    pub mtime: i64,
    pub size: u64,
}

impl DocumentEntry {
    pub fn extension(&self) -> String {
        Path::new(&self.path)
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default()
    }
}

/// Host-provided access to the document collection.
pub trait DocumentSource: Send + Sync {
    /// Enumerate all documents, in a deterministic order.
    fn list(&self) -> Result<Vec<DocumentEntry>>;

    /// Read the full content of one document.
    fn read(&self, path: &str) -> Result<Vec<u8>>;
}

impl<T: DocumentSource + ?Sized> DocumentSource for Arc<T> {
    fn list(&self) -> Result<Vec<DocumentEntry>> {
        (**self).list()
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path)
    }
}

/// Separator-normalized, vault-relative identity of a document.
pub fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    unified
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Include/exclude glob filter over vault-relative paths. Excludes win.
#[derive(Debug, Clone)]
pub struct PathFilter {
    include: GlobSet,
    exclude: GlobSet,
}

impl PathFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self, SyncError> {
        Ok(Self {
            include: build_globset(include)?,
            exclude: build_globset(exclude)?,
        })
    }

    pub fn is_match(&self, path: &str) -> bool {
        if self.exclude.is_match(path) {
            return false;
        }
        self.include.is_match(path)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, SyncError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| SyncError::Configuration(format!("invalid glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| SyncError::Configuration(format!("invalid glob set: {}", e)))
}

/// Documents under a directory on the local filesystem.
pub struct FsSource {
    root: PathBuf,
    follow_symlinks: bool,
}

impl FsSource {
    pub fn new(root: impl Into<PathBuf>, follow_symlinks: bool) -> Self {
        Self {
            root: root.into(),
            follow_symlinks,
        }
    }
}

impl DocumentSource for FsSource {
    fn list(&self) -> Result<Vec<DocumentEntry>> {
        if !self.root.exists() {
            bail!("Vault root does not exist: {}", self.root.display());
        }

        let mut entries = Vec::new();
        let walker = WalkDir::new(&self.root)
            .follow_links(self.follow_symlinks)
            .sort_by_file_name();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable vault entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel_str = normalize_path(&relative.to_string_lossy());

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %rel_str, error = %e, "Skipping file without metadata");
                    continue;
                }
            };
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);

            entries.push(DocumentEntry {
                path: rel_str,
                mtime,
                size: metadata.len(),
            });
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.root.join(path))?)
    }
}

#[derive(Debug, Clone)]
struct MemoryDoc {
    bytes: Vec<u8>,
    mtime: i64,
    readable: bool,
}

/// In-memory document collection for tests and embedding hosts.
#[derive(Default)]
pub struct MemorySource {
    docs: RwLock<BTreeMap<String, MemoryDoc>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &str, content: impl Into<Vec<u8>>, mtime: i64) {
        if let Ok(mut docs) = self.docs.write() {
            docs.insert(
                normalize_path(path),
                MemoryDoc {
                    bytes: content.into(),
                    mtime,
                    readable: true,
                },
            );
        }
    }

    pub fn remove(&self, path: &str) {
        if let Ok(mut docs) = self.docs.write() {
            docs.remove(&normalize_path(path));
        }
    }

    /// Make reads of `path` fail while it still shows up in listings.
    pub fn set_unreadable(&self, path: &str) {
        if let Ok(mut docs) = self.docs.write() {
            if let Some(doc) = docs.get_mut(&normalize_path(path)) {
                doc.readable = false;
            }
        }
    }
}

impl DocumentSource for MemorySource {
    fn list(&self) -> Result<Vec<DocumentEntry>> {
        let docs = self
            .docs
            .read()
            .map_err(|_| anyhow::anyhow!("memory source lock poisoned"))?;
        Ok(docs
            .iter()
            .map(|(path, doc)| DocumentEntry {
                path: path.clone(),
                mtime: doc.mtime,
                size: doc.bytes.len() as u64,
            })
            .collect())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let docs = self
            .docs
            .read()
            .map_err(|_| anyhow::anyhow!("memory source lock poisoned"))?;
        match docs.get(path) {
            Some(doc) if doc.readable => Ok(doc.bytes.clone()),
            Some(_) => bail!("permission denied: {}", path),
            None => bail!("no such document: {}", path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn filter(include: &[&str], exclude: &[&str]) -> PathFilter {
        let inc: Vec<String> = include.iter().map(|s| s.to_string()).collect();
        let exc: Vec<String> = exclude.iter().map(|s| s.to_string()).collect();
        PathFilter::new(&inc, &exc).unwrap()
    }

    #[test]
    fn exclude_takes_precedence() {
        let f = filter(&["**/*.md"], &["private/**"]);
        assert!(f.is_match("notes/a.md"));
        assert!(f.is_match("a.md"));
        assert!(!f.is_match("private/secret.md"));
        assert!(!f.is_match("notes/a.txt"));
    }

    #[test]
    fn single_star_does_not_cross_directories() {
        let f = filter(&["*.md"], &[]);
        assert!(f.is_match("top.md"));
        assert!(!f.is_match("nested/deep.md"));
    }

    #[test]
    fn character_classes_are_supported() {
        let f = filter(&["journal/202[34]-*.md"], &[]);
        assert!(f.is_match("journal/2023-01-01.md"));
        assert!(!f.is_match("journal/2022-01-01.md"));
    }

    #[test]
    fn malformed_pattern_is_a_configuration_error() {
        let err = PathFilter::new(&["notes/[a.md".to_string()], &[]).unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
    }

    #[test]
    fn normalize_path_unifies_separators() {
        assert_eq!(normalize_path("a\\b\\c.md"), "a/b/c.md");
        assert_eq!(normalize_path("./a//b.md"), "a/b.md");
    }

    #[test]
    fn fs_source_lists_sorted_relative_paths() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("b.md"), "b").unwrap();
        std::fs::write(tmp.path().join("sub/a.md"), "aa").unwrap();

        let source = FsSource::new(tmp.path(), false);
        let entries = source.list().unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["b.md", "sub/a.md"]);
        assert_eq!(entries[1].size, 2);
        assert_eq!(source.read("sub/a.md").unwrap(), b"aa");
    }

    #[test]
    fn fs_source_missing_root_is_an_error() {
        let source = FsSource::new("/definitely/not/here", false);
        assert!(source.list().is_err());
    }

    #[test]
    fn memory_source_unreadable_documents_fail_reads() {
        let source = MemorySource::new();
        source.insert("a.md", "hello", 1);
        source.set_unreadable("a.md");
        assert_eq!(source.list().unwrap().len(), 1);
        assert!(source.read("a.md").is_err());
    }
}
