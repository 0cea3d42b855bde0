//! On-disk persistence for the file state and the sync session.
//!
//! Both records live as JSON files in the state directory and are written
//! atomically (temp file, fsync, rename). Either file may be deleted
//! independently; a missing or unreadable file reads as "no record".

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::SyncError;
use crate::models::FileState;

pub const FILE_STATE_FILE: &str = "file_state.json";
pub const SESSION_FILE: &str = "sync_session.json";

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_state_path(&self) -> PathBuf {
        self.dir.join(FILE_STATE_FILE)
    }

    pub fn session_path(&self) -> PathBuf {
        self.dir.join(SESSION_FILE)
    }

    /// Last persisted file state. A corrupt record is logged and ignored.
    pub fn load_file_state(&self) -> Option<FileState> {
        let path = self.file_state_path();
        match read_json::<FileState>(&path) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable file state");
                None
            }
        }
    }

    pub fn save_file_state(&self, state: &FileState) -> Result<(), SyncError> {
        write_json_atomic(&self.file_state_path(), state)
    }

    pub fn clear_file_state(&self) -> Result<(), SyncError> {
        remove_if_exists(&self.file_state_path())
    }
}

/// Serialize `value` to `path` through a sibling temp file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| SyncError::Persistence(format!("invalid path: {}", path.display())))?;
    let tmp_path = path.with_file_name(format!("{name}.tmp"));
    let data = serde_json::to_string_pretty(value)?;
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(data.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            if let Ok(dir) = fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }
    }
    Ok(())
}

/// `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, SyncError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_str(&raw)?))
}

pub fn remove_if_exists(path: &Path) -> Result<(), SyncError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
