//! Sync progress reporting.
//!
//! Reports which entity type a run is working on and how many documents it
//! has emitted so far. Progress goes to **stderr** so that stdout stays
//! parseable when documents are written there.

use std::io::Write;

use crate::models::EntityType;

/// What the orchestrator reports while a run is in progress.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncProgressEvent {
    /// Extraction for this entity type is starting.
    Started { entity: EntityType },
    /// Running total of documents emitted for this entity type.
    Emitted { entity: EntityType, documents: u64 },
    /// The entity type ended with `status` (`succeeded`, `skipped`, `failed`).
    Finished { entity: EntityType, status: String },
}

/// Receives orchestrator events. The CLI implementations write to stderr.
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync work_item  emitted  1,200 documents".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Started { entity } => format!("sync {}  started\n", entity),
            SyncProgressEvent::Emitted { entity, documents } => format!(
                "sync {}  emitted  {} documents\n",
                entity,
                format_number(*documents)
            ),
            SyncProgressEvent::Finished { entity, status } => {
                format!("sync {}  {}\n", entity, status)
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        if let Ok(line) = serde_json::to_string(&event_json(&event)) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

fn event_json(event: &SyncProgressEvent) -> serde_json::Value {
    match event {
        SyncProgressEvent::Started { entity } => serde_json::json!({
            "event": "progress",
            "entity": entity,
            "phase": "started"
        }),
        SyncProgressEvent::Emitted { entity, documents } => serde_json::json!({
            "event": "progress",
            "entity": entity,
            "phase": "emitting",
            "documents": documents
        }),
        SyncProgressEvent::Finished { entity, status } => serde_json::json!({
            "event": "progress",
            "entity": entity,
            "phase": "finished",
            "status": status
        }),
    }
}

/// Drops every event.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Value of `azdo sync --progress`.
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

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
