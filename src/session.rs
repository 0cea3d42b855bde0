//! Resumable batched sync session.
//!
//! A [`SyncSession`] is the durable queue of a sync run: the planned actions
//! still to send, counters, and the errors seen so far. [`SessionManager`]
//! owns it, persists it to `sync_session.json` after every mutation, and
//! hands out the [`CancellationToken`] the batch loop and executor watch.
//!
//! ```text
//! idle ──initialize──▶ running ──pause──▶ paused ──resume──▶ running
//!                         │                  │
//!                         └──────stop────────┴──▶ stopping ──(grace)──▶ cleared
//! ```
//!
//! A paused session with work left survives process restarts: the next
//! `initialize` picks it up instead of starting over.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RecordedError;
use crate::models::DeltaAction;
use crate::store::{read_json, remove_if_exists, write_json_atomic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Running,
    Paused,
    Stopping,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Running => "running",
            SessionState::Paused => "paused",
            SessionState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSession {
    pub id: String,
    pub state: SessionState,
    pub start_time: DateTime<Utc>,
    pub pause_time: Option<DateTime<Utc>>,
    pub resume_time: Option<DateTime<Utc>>,
    pub total_actions: usize,
    pub processed_actions: usize,
    pub remaining_actions: VecDeque<DeltaAction>,
    pub processed_ids: IndexSet<String>,
    pub errors: Vec<RecordedError>,
    pub last_checkpoint_time: DateTime<Utc>,
    pub batch_size: usize,
}

impl SyncSession {
    fn new(actions: Vec<DeltaAction>, batch_size: usize) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: SessionState::Running,
            start_time: now,
            pause_time: None,
            resume_time: None,
            total_actions: actions.len(),
            processed_actions: 0,
            remaining_actions: actions.into(),
            processed_ids: IndexSet::new(),
            errors: Vec::new(),
            last_checkpoint_time: now,
            batch_size: batch_size.max(1),
        }
    }

    /// Counters and queue agree with each other.
    fn is_consistent(&self) -> bool {
        self.batch_size > 0
            && self.processed_actions <= self.total_actions
            && self.processed_actions + self.remaining_actions.len() == self.total_actions
    }
}

/// Point-in-time view of a session for reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionProgress {
    pub processed: usize,
    pub total: usize,
    pub percentage: u32,
    pub remaining: usize,
    pub current_batch: usize,
    pub total_batches: usize,
    pub state: SessionState,
    pub elapsed: Duration,
    pub estimated_remaining: Option<Duration>,
}

pub struct SessionManager {
    path: PathBuf,
    session: Option<SyncSession>,
    token: CancellationToken,
}

impl SessionManager {
    /// Load the session persisted at `path`, if any. Unreadable or
    /// inconsistent records are discarded.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let session = match read_json::<SyncSession>(&path) {
            Ok(Some(session)) if session.is_consistent() => Some(session),
            Ok(Some(_)) => {
                warn!(path = %path.display(), "Discarding inconsistent sync session");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding unreadable sync session");
                None
            }
        };
        Self {
            path,
            session,
            token: CancellationToken::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session(&self) -> Option<&SyncSession> {
        self.session.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(SessionState::Idle)
    }

    /// Token for the current run. Cancelled by `pause` and `stop`.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Start a session over `actions`, or resume the persisted paused one.
    /// Returns `true` when an existing session was resumed, in which case
    /// `actions` is ignored in favour of its queue.
    pub fn initialize(&mut self, actions: Vec<DeltaAction>, batch_size: usize) -> bool {
        self.token = CancellationToken::new();

        if let Some(session) = self.session.as_mut() {
            if session.state == SessionState::Paused && !session.remaining_actions.is_empty() {
                session.state = SessionState::Running;
                session.resume_time = Some(Utc::now());
                session.pause_time = None;
                session.batch_size = batch_size.max(1);
                info!(
                    session = %session.id,
                    remaining = session.remaining_actions.len(),
                    "Resuming sync session"
                );
                self.persist();
                return true;
            }
        }

        let session = SyncSession::new(actions, batch_size);
        debug!(session = %session.id, total = session.total_actions, "Starting sync session");
        self.session = Some(session);
        self.persist();
        false
    }

    /// Next batch from the front of the queue and whether more work remains
    /// after it. Empty unless running.
    pub fn next_batch(&self) -> (Vec<DeltaAction>, bool) {
        match &self.session {
            Some(s) if s.state == SessionState::Running => {
                let n = s.batch_size.min(s.remaining_actions.len());
                let batch: Vec<DeltaAction> = s.remaining_actions.iter().take(n).cloned().collect();
                (batch, s.remaining_actions.len() > n)
            }
            _ => (Vec::new(), false),
        }
    }

    /// Dequeue `completed` from the front of the queue and checkpoint.
    pub fn complete_batch(&mut self, completed: &[DeltaAction]) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.state == SessionState::Idle {
            return;
        }
        let n = completed.len().min(session.remaining_actions.len());
        session.remaining_actions.drain(..n);
        session.processed_actions += n;
        for action in &completed[..n] {
            session.processed_ids.insert(action.id().to_string());
        }
        session.last_checkpoint_time = Utc::now();
        self.persist();
    }

    pub fn pause(&mut self) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if session.state != SessionState::Running {
            return false;
        }
        session.state = SessionState::Paused;
        session.pause_time = Some(Utc::now());
        self.token.cancel();
        info!(session = %session.id, "Sync session paused");
        self.persist();
        true
    }

    pub fn resume(&mut self) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if session.state != SessionState::Paused {
            return false;
        }
        session.state = SessionState::Running;
        session.resume_time = Some(Utc::now());
        session.pause_time = None;
        self.token = CancellationToken::new();
        info!(session = %session.id, "Sync session resumed");
        self.persist();
        true
    }

    /// Cancel the run and mark the session stopping. The caller clears it
    /// once the grace period has passed (see [`SyncController::stop`]).
    pub fn stop(&mut self) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if !matches!(session.state, SessionState::Running | SessionState::Paused) {
            return false;
        }
        session.state = SessionState::Stopping;
        self.token.cancel();
        info!(session = %session.id, "Sync session stopping");
        self.persist();
        true
    }

    /// Drop the session and its persisted record.
    pub fn clear(&mut self) {
        self.session = None;
        if let Err(e) = remove_if_exists(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove sync session file");
        }
    }

    pub fn add_error(&mut self, error: RecordedError) {
        if let Some(session) = self.session.as_mut() {
            session.errors.push(error);
            self.persist();
        }
    }

    pub fn progress(&self) -> Option<SessionProgress> {
        let s = self.session.as_ref()?;
        let percentage = if s.total_actions == 0 {
            100
        } else {
            ((s.processed_actions as f64 / s.total_actions as f64) * 100.0).round() as u32
        };
        let bs = s.batch_size.max(1);

        let until = match (s.state, s.pause_time) {
            (SessionState::Paused, Some(paused)) => paused,
            _ => Utc::now(),
        };
        let elapsed = (until - s.start_time).to_std().unwrap_or_default();
        let remaining = s.remaining_actions.len();
        let estimated_remaining = (s.state == SessionState::Running && s.processed_actions > 0)
            .then(|| elapsed.mul_f64(remaining as f64 / s.processed_actions as f64));

        Some(SessionProgress {
            processed: s.processed_actions,
            total: s.total_actions,
            percentage,
            remaining,
            current_batch: s.processed_actions.div_ceil(bs),
            total_batches: s.total_actions.div_ceil(bs),
            state: s.state,
            elapsed,
            estimated_remaining,
        })
    }

    fn persist(&self) {
        let Some(session) = &self.session else {
            return;
        };
        if let Err(e) = write_json_atomic(&self.path, session) {
            warn!(path = %self.path.display(), error = %e, "Failed to persist sync session");
        }
    }
}

/// Shared handle used by the batch loop and by signal handlers.
#[derive(Clone)]
pub struct SyncController {
    inner: Arc<Mutex<SessionManager>>,
    grace: Duration,
}

impl SyncController {
    pub fn new(manager: SessionManager, grace: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(manager)),
            grace,
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, SessionManager> {
        self.inner.lock().await
    }

    pub async fn pause(&self) -> bool {
        self.inner.lock().await.pause()
    }

    /// Stop the session, give in-flight work the grace period to observe
    /// cancellation, then clear it.
    pub async fn stop(&self) -> bool {
        if !self.inner.lock().await.stop() {
            return false;
        }
        tokio::time::sleep(self.grace).await;
        let mut manager = self.inner.lock().await;
        if manager.state() == SessionState::Stopping {
            manager.clear();
        }
        true
    }

    pub async fn progress(&self) -> Option<SessionProgress> {
        self.inner.lock().await.progress()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorClass, SyncError};
    use tempfile::TempDir;

    fn actions(n: usize) -> Vec<DeltaAction> {
        (0..n)
            .map(|i| DeltaAction::Delete {
                id: format!("doc-{i}"),
                path: format!("doc-{i}.md"),
            })
            .collect()
    }

    fn manager(tmp: &TempDir) -> SessionManager {
        SessionManager::load(tmp.path().join("sync_session.json"))
    }

    #[test]
    fn fresh_session_is_running_and_persisted() {
        let tmp = TempDir::new().unwrap();
        let mut m = manager(&tmp);
        assert_eq!(m.state(), SessionState::Idle);
        assert!(!m.initialize(actions(5), 2));
        assert_eq!(m.state(), SessionState::Running);
        assert!(m.path().exists());
        assert!(!m.token().is_cancelled());
    }

    #[test]
    fn batches_are_fifo_prefixes() {
        let tmp = TempDir::new().unwrap();
        let mut m = manager(&tmp);
        m.initialize(actions(5), 2);

        let (batch, more) = m.next_batch();
        assert_eq!(batch.len(), 2);
        assert!(more);
        assert_eq!(batch[0].id(), "doc-0");
        m.complete_batch(&batch);

        let (batch, more) = m.next_batch();
        assert!(more);
        assert_eq!(batch[0].id(), "doc-2");
        m.complete_batch(&batch);

        let (batch, more) = m.next_batch();
        assert_eq!(batch.len(), 1);
        assert!(!more);
        m.complete_batch(&batch);

        let s = m.session().unwrap();
        assert_eq!(s.processed_actions, 5);
        assert!(s.remaining_actions.is_empty());
        assert_eq!(s.processed_ids.len(), 5);
    }

    #[test]
    fn paused_session_resumes_after_reload() {
        let tmp = TempDir::new().unwrap();
        let mut m = manager(&tmp);
        m.initialize(actions(5), 2);
        let (batch, _) = m.next_batch();
        m.complete_batch(&batch);
        let token = m.token();
        assert!(m.pause());
        assert!(token.is_cancelled());
        let id = m.session().unwrap().id.clone();

        let mut reloaded = manager(&tmp);
        assert_eq!(reloaded.state(), SessionState::Paused);
        assert!(reloaded.initialize(actions(9), 10));
        let s = reloaded.session().unwrap();
        assert_eq!(s.id, id);
        assert_eq!(s.state, SessionState::Running);
        assert_eq!(s.processed_actions, 2);
        assert_eq!(s.total_actions, 5);
        assert_eq!(s.batch_size, 10);
        assert!(s.resume_time.is_some());
        assert!(!reloaded.token().is_cancelled());
        assert_eq!(reloaded.next_batch().0.len(), 3);
    }

    #[test]
    fn transitions_only_apply_in_valid_states() {
        let tmp = TempDir::new().unwrap();
        let mut m = manager(&tmp);
        assert!(!m.pause());
        assert!(!m.resume());
        assert!(!m.stop());

        m.initialize(actions(3), 1);
        assert!(!m.resume());
        assert!(m.pause());
        assert!(!m.pause());
        assert_eq!(m.next_batch(), (Vec::new(), false));
        assert!(m.resume());
        assert!(m.stop());
        assert!(!m.stop());
        assert_eq!(m.state(), SessionState::Stopping);
        assert!(m.token().is_cancelled());
    }

    #[test]
    fn stopping_session_is_not_resumed() {
        let tmp = TempDir::new().unwrap();
        let mut m = manager(&tmp);
        m.initialize(actions(3), 1);
        m.stop();

        let mut reloaded = manager(&tmp);
        assert!(!reloaded.initialize(actions(1), 1));
        assert_eq!(reloaded.session().unwrap().total_actions, 1);
    }

    #[test]
    fn corrupt_session_is_discarded() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sync_session.json");
        std::fs::write(&path, "{\"id\": 3}").unwrap();
        assert!(SessionManager::load(&path).session().is_none());
    }

    #[test]
    fn inconsistent_session_is_discarded() {
        let tmp = TempDir::new().unwrap();
        let mut m = manager(&tmp);
        m.initialize(actions(2), 1);
        m.pause();

        let path = m.path().to_path_buf();
        let mut raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        raw["processed_actions"] = serde_json::json!(7);
        std::fs::write(&path, raw.to_string()).unwrap();

        assert!(SessionManager::load(&path).session().is_none());
    }

    #[test]
    fn progress_reports_batches_and_percentage() {
        let tmp = TempDir::new().unwrap();
        let mut m = manager(&tmp);
        m.initialize(actions(5), 2);
        let (batch, _) = m.next_batch();
        m.complete_batch(&batch);

        let p = m.progress().unwrap();
        assert_eq!(p.processed, 2);
        assert_eq!(p.total, 5);
        assert_eq!(p.percentage, 40);
        assert_eq!(p.remaining, 3);
        assert_eq!(p.current_batch, 1);
        assert_eq!(p.total_batches, 3);
        assert!(p.estimated_remaining.is_some());

        m.initialize(actions(20), 5);
        for _ in 0..2 {
            let (batch, _) = m.next_batch();
            m.complete_batch(&batch);
        }
        let p = m.progress().unwrap();
        assert_eq!(
            (p.processed, p.percentage, p.remaining, p.current_batch, p.total_batches),
            (10, 50, 10, 2, 4)
        );
    }

    #[test]
    fn empty_session_is_complete() {
        let tmp = TempDir::new().unwrap();
        let mut m = manager(&tmp);
        m.initialize(Vec::new(), 10);
        let p = m.progress().unwrap();
        assert_eq!(p.percentage, 100);
        assert_eq!(p.total_batches, 0);
        assert_eq!(m.next_batch(), (Vec::new(), false));
    }

    #[test]
    fn elapsed_is_frozen_while_paused() {
        let tmp = TempDir::new().unwrap();
        let mut m = manager(&tmp);
        m.initialize(actions(2), 1);
        m.pause();
        let first = m.progress().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let second = m.progress().unwrap();
        assert_eq!(first.elapsed, second.elapsed);
        assert!(second.estimated_remaining.is_none());
    }

    #[test]
    fn errors_are_recorded_in_order() {
        let tmp = TempDir::new().unwrap();
        let mut m = manager(&tmp);
        m.initialize(actions(1), 1);
        m.add_error(RecordedError::for_path("a.md", &SyncError::executor("first")));
        m.add_error(RecordedError::for_batch(&SyncError::executor("Quota exceeded")));
        let reloaded = manager(&tmp);
        let errors = &reloaded.session().unwrap().errors;
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].path.as_deref(), Some("a.md"));
        assert_eq!(errors[0].class, ErrorClass::Fatal);
        assert_eq!(errors[1].class, ErrorClass::Transient);
    }

    #[tokio::test]
    async fn controller_stop_clears_after_grace() {
        let tmp = TempDir::new().unwrap();
        let mut m = manager(&tmp);
        m.initialize(actions(3), 1);
        let path = m.path().to_path_buf();
        let controller = SyncController::new(m, Duration::from_millis(10));

        assert!(controller.stop().await);
        assert_eq!(controller.lock().await.state(), SessionState::Idle);
        assert!(!path.exists());
        assert!(!controller.stop().await);
    }
}
