//! Sync progress reporting.
//!
//! Reports observable progress during `docsync sync` so operators can see
//! what is being listed, how far processing has got, and what the purge
//! did. Progress goes to **stderr** so stdout remains parseable.

use std::io::Write;

/// A single progress event of a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncProgressEvent {
    /// The listing has started; no total known yet.
    Listing { scope: String },
    /// `done` documents finished out of `listed` seen so far.
    Processing {
        scope: String,
        done: u64,
        listed: u64,
        failed: u64,
    },
    /// Processing is complete; stale entries are being removed.
    Reconciling { scope: String, stale: u64 },
}

/// Receives progress events from the orchestrator.
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress: "sync filesystem:docs  processing  1,234 / 5,000 documents".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Listing { scope } => format!("sync {}  listing...\n", scope),
            SyncProgressEvent::Processing {
                scope,
                done,
                listed,
                failed,
            } => {
                let mut line = format!(
                    "sync {}  processing  {} / {} documents",
                    scope,
                    format_number(*done),
                    format_number(*listed)
                );
                if *failed > 0 {
                    line.push_str(&format!("  ({} failed)", format_number(*failed)));
                }
                line.push('\n');
                line
            }
            SyncProgressEvent::Reconciling { scope, stale } => format!(
                "sync {}  reconciling  {} stale entries\n",
                scope,
                format_number(*stale)
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Listing { scope } => serde_json::json!({
                "event": "progress",
                "scope": scope,
                "phase": "listing"
            }),
            SyncProgressEvent::Processing {
                scope,
                done,
                listed,
                failed,
            } => serde_json::json!({
                "event": "progress",
                "scope": scope,
                "phase": "processing",
                "done": done,
                "listed": listed,
                "failed": failed
            }),
            SyncProgressEvent::Reconciling { scope, stale } => serde_json::json!({
                "event": "progress",
                "scope": scope,
                "phase": "reconciling",
                "stale": stale
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
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
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
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
}
