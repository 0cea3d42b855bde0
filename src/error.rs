//! Classified failures of the sync pipeline.
//!
//! Only [`SyncError::Configuration`] ends a sync attempt outright. Scan and
//! persistence failures are absorbed where they happen (logged, then the
//! document or record is skipped); executor failures are folded into the
//! session's error list and weighed by the success-rate policy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether a remote failure is worth retrying later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Quota, rate limiting, timeouts, temporary unavailability.
    Transient,
    /// Everything else.
    Fatal,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Failed to scan {path}: {message}")]
    Scan { path: String, message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Executor error: {message}")]
    Executor { class: ErrorClass, message: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    pub fn executor(message: impl Into<String>) -> Self {
        let message = message.into();
        SyncError::Executor {
            class: classify_error(&message),
            message,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Executor { class, .. } => *class,
            _ => ErrorClass::Fatal,
        }
    }
}

/// A failure kept in the session's error list, classified when it happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedError {
    pub class: ErrorClass,
    /// Document the failure belongs to; `None` for a whole-batch failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub message: String,
}

impl RecordedError {
    pub fn for_path(path: impl Into<String>, error: &SyncError) -> Self {
        Self {
            class: error.class(),
            path: Some(path.into()),
            message: error.to_string(),
        }
    }

    pub fn for_batch(error: &SyncError) -> Self {
        Self {
            class: error.class(),
            path: None,
            message: error.to_string(),
        }
    }
}

impl std::fmt::Display for RecordedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}: {}", path, self.message),
            None => f.write_str(&self.message),
        }
    }
}

const TRANSIENT_MARKERS: &[&str] = &[
    "quota",
    "rate limit",
    "too many requests",
    "429",
    "timed out",
    "timeout",
    "temporarily unavailable",
    "503",
];

/// Classify a free-form remote error message. Pass the message only, never
/// a document path: paths can contain any of the markers.
pub fn classify_error(message: &str) -> ErrorClass {
    let lower = message.to_ascii_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_and_rate_limits_are_transient() {
        assert_eq!(
            classify_error("Quota exceeded: too many records"),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_error("Chroma API error 429 Too Many Requests"),
            ErrorClass::Transient
        );
        assert_eq!(classify_error("request timed out"), ErrorClass::Transient);
    }

    #[test]
    fn other_errors_are_fatal() {
        assert_eq!(
            classify_error("Chroma API error 401 Unauthorized"),
            ErrorClass::Fatal
        );
        assert_eq!(
            SyncError::Configuration("bad glob".into()).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            SyncError::executor("Quota exceeded").class(),
            ErrorClass::Transient
        );
    }

    #[test]
    fn recorded_error_keeps_class_independent_of_path() {
        let fatal = RecordedError::for_path(
            "notes/quota-planning-2024-0429.md",
            &SyncError::executor("invalid metadata"),
        );
        assert_eq!(fatal.class, ErrorClass::Fatal);
        assert_eq!(
            fatal.to_string(),
            "notes/quota-planning-2024-0429.md: Executor error: invalid metadata"
        );

        let batch = RecordedError::for_batch(&SyncError::executor("request timed out"));
        assert_eq!(batch.class, ErrorClass::Transient);
        assert!(batch.path.is_none());
    }
}
