//! Local sync status overview.
//!
//! Summarizes the persisted state directory without contacting the remote:
//! how many documents are recorded, which ones are pending retry, the last
//! verification verdict and the progress of any persisted session. Used by
//! `vsync status`.

use serde::Serialize;

use crate::delta::retryable_files;
use crate::models::{ChromaVerification, FileState};
use crate::progress::format_number;
use crate::session::{SessionManager, SessionProgress, SessionState};
use crate::store::StateStore;

#[derive(Debug, Clone, Serialize)]
pub struct FailedFile {
    pub path: String,
    pub retries: u32,
    pub retryable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub state: SessionState,
    pub processed: usize,
    pub total: usize,
    pub percentage: u32,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state_dir: String,
    pub has_file_state: bool,
    pub documents: usize,
    pub total_bytes: u64,
    pub last_sync_time: Option<chrono::DateTime<chrono::Utc>>,
    pub failed: Vec<FailedFile>,
    pub verification: Option<ChromaVerification>,
    pub session: Option<SessionSummary>,
}

/// Collect the status of `store`, with retry eligibility judged against
/// `max_retries`.
pub fn collect_status(store: &StateStore, max_retries: u32) -> StatusReport {
    let state = store.load_file_state();
    let has_file_state = state.is_some();
    let state = state.unwrap_or_else(FileState::empty);

    let retryable = retryable_files(&state, max_retries);
    let failed = state
        .partial_sync
        .as_ref()
        .map(|p| {
            p.failed_files
                .iter()
                .map(|path| {
                    let retries = p.retry_count.get(path).copied().unwrap_or(0);
                    FailedFile {
                        path: path.clone(),
                        retries,
                        retryable: retryable.contains(path),
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let manager = SessionManager::load(store.session_path());
    let session = manager.session().and_then(|s| {
        manager.progress().map(|p: SessionProgress| SessionSummary {
            id: s.id.clone(),
            state: p.state,
            processed: p.processed,
            total: p.total,
            percentage: p.percentage,
            errors: s.errors.len(),
        })
    });

    StatusReport {
        state_dir: store.dir().display().to_string(),
        has_file_state,
        documents: state.files.len(),
        total_bytes: state.files.values().map(|f| f.size).sum(),
        last_sync_time: has_file_state.then_some(state.last_sync_time),
        failed,
        verification: state.chroma_verification,
        session,
    }
}

impl StatusReport {
    pub fn print(&self) {
        println!("Vault Sync Status");
        println!("=================");
        println!();
        println!("  State dir:   {}", self.state_dir);
        if !self.has_file_state {
            println!("  No sync recorded yet.");
        } else {
            println!("  Documents:   {}", format_number(self.documents as u64));
            println!("  Size:        {}", format_bytes(self.total_bytes));
            if let Some(t) = self.last_sync_time {
                println!("  Last sync:   {}", t.format("%Y-%m-%d %H:%M:%S UTC"));
            }
        }

        if !self.failed.is_empty() {
            println!();
            println!("  Failed files ({}):", self.failed.len());
            for f in &self.failed {
                let note = if f.retryable { "" } else { "  (retries exhausted)" };
                println!("    {}  retries={}{}", f.path, f.retries, note);
            }
        }

        println!();
        match &self.verification {
            Some(v) => {
                println!(
                    "  Verification: {} at {}",
                    v.status,
                    v.last_verification_time.format("%Y-%m-%d %H:%M:%S UTC")
                );
                if let Some(i) = &v.inconsistencies {
                    println!(
                        "    missing remotely: {}, extra remotely: {}",
                        i.missing_remotely.len(),
                        i.extra_remotely.len()
                    );
                }
            }
            None => println!("  Verification: never"),
        }

        if let Some(s) = &self.session {
            println!();
            println!("  Session {} ({})", s.id, s.state);
            println!(
                "    {} / {} actions ({}%), {} errors",
                format_number(s.processed as u64),
                format_number(s.total as u64),
                s.percentage,
                s.errors
            );
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
