//! Sync progress reporting.
//!
//! Reports what `vsync sync` is doing (scanning, the planned delta, batch
//! progress, pause, verification) so users can follow long runs. Progress
//! is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use crate::models::DeltaStats;

/// A single progress event for sync.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncProgressEvent {
    /// The vault is being fingerprinted. Total unknown.
    Scanning,
    /// The delta plan is ready.
    Planned { stats: DeltaStats, resumed: bool },
    /// A batch finished.
    Batch {
        processed: usize,
        total: usize,
        percentage: u32,
        batch: usize,
        total_batches: usize,
    },
    /// The session was paused and can be resumed by the next sync.
    Paused { processed: usize, total: usize },
    /// The remote collection is being verified.
    Verifying,
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync  batch 3/20  150 / 1,000 actions (15%)".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Scanning => "sync  scanning vault...\n".to_string(),
            SyncProgressEvent::Planned { stats, resumed } => {
                let prefix = if *resumed { "resuming, " } else { "" };
                format!(
                    "sync  {}{} added, {} updated, {} deleted, {} retried, {} unchanged\n",
                    prefix,
                    format_number(stats.added as u64),
                    format_number(stats.updated as u64),
                    format_number(stats.deleted as u64),
                    format_number(stats.retried as u64),
                    format_number(stats.unchanged as u64),
                )
            }
            SyncProgressEvent::Batch {
                processed,
                total,
                percentage,
                batch,
                total_batches,
            } => format!(
                "sync  batch {}/{}  {} / {} actions ({}%)\n",
                batch,
                total_batches,
                format_number(*processed as u64),
                format_number(*total as u64),
                percentage
            ),
            SyncProgressEvent::Paused { processed, total } => format!(
                "sync  paused at {} / {} actions; run sync again to resume\n",
                format_number(*processed as u64),
                format_number(*total as u64)
            ),
            SyncProgressEvent::Verifying => "sync  verifying remote collection...\n".to_string(),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Scanning => serde_json::json!({
                "event": "progress",
                "phase": "scanning"
            }),
            SyncProgressEvent::Planned { stats, resumed } => serde_json::json!({
                "event": "progress",
                "phase": "planned",
                "resumed": resumed,
                "stats": stats
            }),
            SyncProgressEvent::Batch {
                processed,
                total,
                percentage,
                batch,
                total_batches,
            } => serde_json::json!({
                "event": "progress",
                "phase": "syncing",
                "processed": processed,
                "total": total,
                "percentage": percentage,
                "batch": batch,
                "total_batches": total_batches
            }),
            SyncProgressEvent::Paused { processed, total } => serde_json::json!({
                "event": "progress",
                "phase": "paused",
                "processed": processed,
                "total": total
            }),
            SyncProgressEvent::Verifying => serde_json::json!({
                "event": "progress",
                "phase": "verifying"
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "off" | "none" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn progress_mode_parse() {
        assert_eq!(ProgressMode::parse("json"), Some(ProgressMode::Json));
        assert_eq!(ProgressMode::parse("none"), Some(ProgressMode::Off));
        assert_eq!(ProgressMode::parse("loud"), None);
    }
}
