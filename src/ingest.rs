//! Sync orchestration.
//!
//! Coordinates the full flow: scan → diff (+ retries) → session → batched
//! execution → persisted file state → optional verification. A paused run
//! leaves its session on disk and the next `run` resumes it.
//!
//! The file state only ever records what reached the remote: documents whose
//! action failed keep their previous fingerprint (or are dropped) and land in
//! the retry bookkeeping instead. Once a document has used up its retry
//! budget its current fingerprint is recorded, so it is not planned again
//! until its content changes.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::delta::{
    exhausted_files, mark_failed, mark_succeeded, needs_verification, retryable_files, DeltaEngine,
};
use crate::error::{ErrorClass, RecordedError, SyncError};
use crate::executor::{BatchExecutor, BatchOutcome};
use crate::models::{DeltaAction, DeltaStats, FileState};
use crate::progress::{SyncProgressEvent, SyncProgressReporter};
use crate::session::{SessionState, SyncController};
use crate::store::StateStore;
use crate::verify::{run_verification, MembershipReport, VerificationBackend};

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Re-send every document regardless of its recorded hash.
    pub full: bool,
    /// Plan only; nothing is sent or persisted.
    pub dry_run: bool,
    /// Overrides `sync.batch_size`.
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    PartialFailure,
    Paused,
    Stopped,
    DryRun,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncStatus::Success => "success",
            SyncStatus::PartialFailure => "partial failure",
            SyncStatus::Paused => "paused",
            SyncStatus::Stopped => "stopped",
            SyncStatus::DryRun => "dry run",
        };
        f.write_str(s)
    }
}

/// One planned action, as listed by a dry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedAction {
    pub action: &'static str,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub status: SyncStatus,
    pub stats: DeltaStats,
    pub resumed: bool,
    pub total_actions: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub errors: Vec<RecordedError>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub planned: Vec<PlannedAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<MembershipReport>,
}

impl SyncReport {
    pub fn print_summary(&self) {
        println!("sync ({})", self.status);
        if self.status == SyncStatus::DryRun {
            for p in &self.planned {
                println!("  {:<6} {}", p.action, p.path);
            }
        }
        println!("  added: {}", self.stats.added);
        println!("  updated: {}", self.stats.updated);
        println!("  deleted: {}", self.stats.deleted);
        println!("  retried: {}", self.stats.retried);
        println!("  unchanged: {}", self.stats.unchanged);
        if self.status != SyncStatus::DryRun {
            if self.resumed {
                println!("  resumed session: yes");
            }
            println!("  processed: {} / {}", self.processed, self.total_actions);
            println!("  succeeded: {}", self.succeeded);
            println!("  failed: {}", self.failed.len());
            for path in &self.failed {
                println!("    {}", path);
            }
        }
        if !self.skipped.is_empty() {
            println!("  skipped (unreadable): {}", self.skipped.len());
        }
        if let Some(v) = &self.verification {
            let verdict = if v.is_consistent() { "verified" } else { "inconsistent" };
            println!(
                "  verification: {} ({} missing, {} extra)",
                verdict,
                v.missing_remotely.len(),
                v.extra_remotely.len()
            );
        }
    }
}

/// Whether a finished run counts as a success.
///
/// Succeeds when the success rate meets `threshold`, when the plan was
/// empty, or when every error was transient and at least one action went
/// through.
pub fn is_success(total: usize, succeeded: usize, errors: &[RecordedError], threshold: f64) -> bool {
    if total == 0 {
        return true;
    }
    if succeeded as f64 / total as f64 >= threshold {
        return true;
    }
    succeeded >= 1
        && !errors.is_empty()
        && errors
            .iter()
            .all(|e| e.class == ErrorClass::Transient)
}

pub struct SyncPipeline {
    pub engine: DeltaEngine,
    pub executor: Arc<dyn BatchExecutor>,
    pub verifier: Option<Arc<dyn VerificationBackend>>,
    pub store: StateStore,
    pub settings: SyncConfig,
    pub progress: Box<dyn SyncProgressReporter>,
}

impl SyncPipeline {
    pub async fn run(&mut self, controller: &SyncController, options: &SyncOptions) -> Result<SyncReport> {
        self.progress.report(SyncProgressEvent::Scanning);
        let previous = self.store.load_file_state();
        self.engine.scan()?;

        let baseline = if options.full {
            previous.clone().map(forget_hashes)
        } else {
            previous.clone()
        };
        let mut plan = self.engine.diff(baseline.as_ref());
        if let Some(prev) = &previous {
            let retries = retryable_files(prev, self.settings.max_retries);
            self.engine.add_retries(&mut plan, &retries);
        }
        debug!(stats = ?plan.stats, skipped = plan.skipped.len(), "Delta planned");

        let mut report = SyncReport {
            status: SyncStatus::DryRun,
            stats: plan.stats,
            resumed: false,
            total_actions: plan.actions.len(),
            processed: 0,
            succeeded: 0,
            failed: Vec::new(),
            skipped: plan.skipped.clone(),
            errors: Vec::new(),
            planned: Vec::new(),
            verification: None,
        };

        if options.dry_run {
            report.planned = plan
                .actions
                .iter()
                .map(|a| PlannedAction {
                    action: match a {
                        DeltaAction::Upsert { .. } => "upsert",
                        DeltaAction::Delete { .. } => "delete",
                    },
                    path: a.path().to_string(),
                })
                .collect();
            return Ok(report);
        }

        let batch_size = options.batch_size.unwrap_or(self.settings.batch_size).max(1);
        let (resumed, token) = {
            let mut manager = controller.lock().await;
            let resumed = manager.initialize(plan.actions.clone(), batch_size);
            (resumed, manager.token())
        };
        report.resumed = resumed;
        self.progress.report(SyncProgressEvent::Planned {
            stats: plan.stats,
            resumed,
        });

        let mut succeeded_actions: Vec<DeltaAction> = Vec::new();
        let mut failed_paths: Vec<String> = Vec::new();

        loop {
            let (batch, _) = controller.lock().await.next_batch();
            if batch.is_empty() || token.is_cancelled() {
                break;
            }

            let mut outcome = match self.executor.execute(&batch, &token).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, actions = batch.len(), "Batch failed");
                    BatchOutcome::failed(&batch, &e)
                }
            };
            if outcome.processed == 0 && !token.is_cancelled() {
                // The same front batch would come back on every turn.
                let e = SyncError::executor("executor handled none of the batch");
                warn!(error = %e, actions = batch.len(), "Batch failed");
                outcome = BatchOutcome::failed(&batch, &e);
            }

            let handled = &batch[..outcome.processed.min(batch.len())];
            let failed_ids: HashSet<&str> =
                outcome.failed_ids.iter().map(String::as_str).collect();
            for action in handled {
                if failed_ids.contains(action.id()) {
                    failed_paths.push(action.path().to_string());
                } else {
                    succeeded_actions.push(action.clone());
                }
            }
            if handled.len() < batch.len() && !token.is_cancelled() {
                debug!(
                    handled = handled.len(),
                    batch = batch.len(),
                    "Executor handled part of the batch, the rest goes next"
                );
            }

            let progress = {
                let mut manager = controller.lock().await;
                manager.complete_batch(handled);
                for e in outcome.errors {
                    manager.add_error(e);
                }
                manager.progress()
            };
            if let Some(p) = progress {
                self.progress.report(SyncProgressEvent::Batch {
                    processed: p.processed,
                    total: p.total,
                    percentage: p.percentage,
                    batch: p.current_batch,
                    total_batches: p.total_batches,
                });
            }

            if token.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.settings.inter_batch_delay()) => {}
            }
        }

        let (state, session) = {
            let manager = controller.lock().await;
            (manager.state(), manager.session().cloned())
        };
        let (total, processed, errors, unprocessed) = match &session {
            Some(s) => (
                s.total_actions,
                s.processed_actions,
                s.errors.clone(),
                s.remaining_actions
                    .iter()
                    .map(|a| a.path().to_string())
                    .collect::<Vec<_>>(),
            ),
            None => (0, 0, Vec::new(), Vec::new()),
        };
        let succeeded = processed.saturating_sub(failed_paths.len());

        report.status = match state {
            SessionState::Paused => SyncStatus::Paused,
            SessionState::Stopping | SessionState::Idle if token.is_cancelled() => {
                SyncStatus::Stopped
            }
            _ if is_success(total, succeeded, &errors, self.settings.success_threshold) => {
                SyncStatus::Success
            }
            _ => SyncStatus::PartialFailure,
        };

        let succeeded_paths: Vec<String> =
            succeeded_actions.iter().map(|a| a.path().to_string()).collect();
        let mut next = if report.status == SyncStatus::Success && !resumed {
            let mut next = self.engine.snapshot();
            if let Some(prev) = &previous {
                next.partial_sync = prev.partial_sync.clone();
                if succeeded_actions.is_empty() {
                    next.chroma_verification = prev.chroma_verification.clone();
                }
            }
            for path in plan.skipped.iter().chain(failed_paths.iter()) {
                restore_previous(&mut next, previous.as_ref(), path);
            }
            next
        } else {
            let mut next = previous.clone().unwrap_or_else(FileState::empty);
            next.apply_actions(&succeeded_actions);
            if !succeeded_actions.is_empty() {
                next.chroma_verification = None;
            }
            next
        };
        mark_succeeded(&mut next, &succeeded_paths);
        mark_failed(&mut next, &failed_paths);
        if report.status == SyncStatus::PartialFailure {
            mark_failed(&mut next, &unprocessed);
        }
        let mut failed_now: HashSet<&str> = failed_paths.iter().map(String::as_str).collect();
        if report.status == SyncStatus::PartialFailure {
            failed_now.extend(unprocessed.iter().map(String::as_str));
        }
        for path in exhausted_files(&next, self.settings.max_retries) {
            if failed_now.contains(path.as_str()) {
                warn!(
                    path = %path,
                    retries = self.settings.max_retries,
                    "Retry budget spent, not planning again until the document changes"
                );
                settle_current(&mut next, &self.engine, &path);
            }
        }
        if let Err(e) = self.store.save_file_state(&next) {
            warn!(error = %e, "Failed to persist file state");
        }

        match report.status {
            SyncStatus::Success | SyncStatus::PartialFailure => controller.lock().await.clear(),
            SyncStatus::Paused => self.progress.report(SyncProgressEvent::Paused {
                processed,
                total,
            }),
            _ => {}
        }

        info!(
            status = %report.status,
            processed,
            total,
            failed = failed_paths.len(),
            "Sync finished"
        );

        report.total_actions = total;
        report.processed = processed;
        report.succeeded = succeeded;
        report.failed = failed_paths;
        if report.status == SyncStatus::PartialFailure {
            report.failed.extend(unprocessed);
        }
        report.errors = errors;

        let finished = matches!(report.status, SyncStatus::Success | SyncStatus::PartialFailure);
        if finished && self.settings.verify_after_sync {
            if let Some(verifier) = &self.verifier {
                if needs_verification(&next, self.settings.verification_max_age()) {
                    self.progress.report(SyncProgressEvent::Verifying);
                    match run_verification(verifier.as_ref(), &self.store).await {
                        Ok(v) => report.verification = Some(v),
                        Err(e) => warn!(error = %e, "Verification after sync failed"),
                    }
                }
            }
        }

        Ok(report)
    }
}

/// Blank every recorded hash so each present document diffs as updated.
fn forget_hashes(mut state: FileState) -> FileState {
    for fp in state.files.values_mut() {
        fp.hash.clear();
    }
    state
}

/// Put back the previous fingerprint of `path`, or drop it if there was none.
fn restore_previous(next: &mut FileState, previous: Option<&FileState>, path: &str) {
    match previous.and_then(|p| p.files.get(path)) {
        Some(fp) => {
            next.files.insert(path.to_string(), fp.clone());
        }
        None => {
            next.files.remove(path);
        }
    }
}

/// Record `path` as last scanned, or forget it if it is no longer present.
fn settle_current(next: &mut FileState, engine: &DeltaEngine, path: &str) {
    match engine.current().get(path) {
        Some(fp) => {
            next.files.insert(path.to_string(), fp.clone());
        }
        None => {
            next.files.remove(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn errs(items: &[(&str, &str)]) -> Vec<RecordedError> {
        items
            .iter()
            .map(|(path, message)| RecordedError::for_path(*path, &SyncError::executor(*message)))
            .collect()
    }

    #[test]
    fn empty_plan_is_success() {
        assert!(is_success(0, 0, &[], 0.8));
    }

    #[test]
    fn threshold_decides_with_fatal_errors() {
        assert!(is_success(10, 8, &errs(&[("a.md", "permission denied")]), 0.8));
        assert!(!is_success(10, 7, &errs(&[("a.md", "permission denied")]), 0.8));
    }

    #[test]
    fn transient_errors_tolerated_with_progress() {
        let quota = errs(&[("a.md", "Quota exceeded"), ("b.md", "429 Too Many Requests")]);
        assert!(is_success(10, 1, &quota, 0.8));
        assert!(!is_success(10, 0, &quota, 0.8));
    }

    #[test]
    fn mixed_errors_fall_back_to_threshold() {
        let mixed = errs(&[("a.md", "Quota exceeded"), ("b.md", "invalid metadata")]);
        assert!(!is_success(10, 5, &mixed, 0.8));
    }

    #[test]
    fn document_path_does_not_make_an_error_transient() {
        let fatal = errs(&[
            ("notes/quota-planning.md", "invalid metadata"),
            ("2024-0429.md", "invalid metadata"),
        ]);
        assert!(!is_success(10, 1, &fatal, 0.8));
    }

    #[test]
    fn forget_hashes_keeps_paths() {
        let mut state = FileState::empty();
        state.files.insert(
            "a.md".into(),
            crate::models::FileFingerprint {
                path: "a.md".into(),
                hash: "abc".into(),
                mtime: 1,
                size: 1,
            },
        );
        let blank = forget_hashes(state);
        assert_eq!(blank.files["a.md"].hash, "");
    }
}
