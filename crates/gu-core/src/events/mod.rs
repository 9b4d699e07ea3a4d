//! Update progress events.
//!
//! The pipeline notifies an [`ObserverList`] synchronously. Delivery is
//! best effort: an observer that panics is skipped and never changes the
//! session outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Standard progress event names.
pub mod event_names {
    pub const UPDATE_CHECK_STARTED: &str = "update_check_started";
    pub const UPDATE_NOT_NEEDED: &str = "update_not_needed";
    pub const DOWNLOAD_STARTED: &str = "download_started";
    pub const DOWNLOAD_PROGRESS: &str = "download_progress";
    pub const DOWNLOAD_COMPLETED: &str = "download_completed";
    pub const VERIFY_COMPLETED: &str = "verify_completed";
    pub const BACKUP_COMMITTED: &str = "backup_committed";
    pub const APPLY_COMMITTED: &str = "apply_committed";
    pub const INSTALLATION_COMPLETED: &str = "installation_completed";
    pub const LAUNCH_COMPLETED: &str = "launch_completed";
    pub const ROLLBACK_COMPLETED: &str = "rollback_completed";
    pub const SESSION_ABORTED: &str = "session_aborted";
}

/// Pipeline phase for a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Check,
    Fetch,
    Verify,
    Backup,
    Apply,
    Launch,
    Rollback,
    Session,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

/// Structured progress event for observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub event: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, Value>,
}

impl ProgressEvent {
    pub fn new(event: impl Into<String>, phase: Phase) -> Self {
        Self {
            event: event.into(),
            timestamp: Utc::now(),
            session_id: None,
            phase,
            progress: None,
            details: HashMap::new(),
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_progress(mut self, current: u64, total: Option<u64>) -> Self {
        self.progress = Some(Progress { current, total });
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.insert(key.into(), v);
        }
        self
    }

    pub fn to_jsonl(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"serialization_failed","event":"{}"}}"#,
                self.event
            )
        })
    }
}

/// Receives progress events.
pub trait ProgressEmitter: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Ordered list of observers notified synchronously.
#[derive(Default)]
pub struct ObserverList {
    observers: Mutex<Vec<Arc<dyn ProgressEmitter>>>,
}

impl ObserverList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn ProgressEmitter>) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.push(observer);
        }
    }

    pub fn len(&self) -> usize {
        self.observers.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProgressEmitter for ObserverList {
    fn emit(&self, event: ProgressEvent) {
        let observers = match self.observers.lock() {
            Ok(observers) => observers.clone(),
            Err(_) => return,
        };
        for observer in observers {
            let event = event.clone();
            if catch_unwind(AssertUnwindSafe(|| observer.emit(event))).is_err() {
                warn!("progress observer panicked; event dropped for that observer");
            }
        }
    }
}

/// Writes each event as one JSON line.
pub struct JsonlWriter<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonlWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> ProgressEmitter for JsonlWriter<W> {
    fn emit(&self, event: ProgressEvent) {
        let line = event.to_jsonl();
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writeln!(writer, "{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Capture {
        events: Mutex<Vec<ProgressEvent>>,
    }

    impl ProgressEmitter for Capture {
        fn emit(&self, event: ProgressEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    struct Panicker;

    impl ProgressEmitter for Panicker {
        fn emit(&self, _event: ProgressEvent) {
            panic!("observer bug");
        }
    }

    #[test]
    fn test_progress_event_jsonl() {
        let event = ProgressEvent::new(event_names::DOWNLOAD_PROGRESS, Phase::Fetch)
            .with_session_id("gu-1")
            .with_progress(512, Some(1024))
            .with_detail("package", "editor-1.1.0");
        let json = event.to_jsonl();
        assert!(json.contains(r#""event":"download_progress""#));
        assert!(json.contains(r#""current":512"#));
    }

    #[test]
    fn test_panicking_observer_does_not_block_others() {
        let list = ObserverList::new();
        let capture = Arc::new(Capture::default());
        list.register(Arc::new(Panicker));
        list.register(capture.clone());
        list.emit(ProgressEvent::new(event_names::DOWNLOAD_STARTED, Phase::Fetch));
        list.emit(ProgressEvent::new(event_names::DOWNLOAD_COMPLETED, Phase::Fetch));
        assert_eq!(capture.events.lock().unwrap().len(), 2);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_jsonl_writer() {
        let writer = JsonlWriter::new(Vec::new());
        writer.emit(ProgressEvent::new(event_names::SESSION_ABORTED, Phase::Session));
        let bytes = writer.writer.into_inner().unwrap();
        assert!(String::from_utf8(bytes).unwrap().ends_with("}\n"));
    }
}
