//! Failure record: why and when a target was declared failed.

use crate::journal::JournalSnapshot;
use chrono::{DateTime, Utc};
use gu_common::{BatchId, SessionId, TargetId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How the supervised target ended (or why restore was requested).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitReason {
    /// Exited with a code outside the expected set.
    UnexpectedCode { code: i32 },
    /// Killed by a signal.
    Signaled { signal: i32 },
    /// Never became ready within the startup timeout.
    StartupTimeout { after_secs: u64 },
    /// Exited before it became ready.
    ExitedBeforeReady {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
    },
    /// Exited, status unknown (supervised by pid only).
    UnknownStatus,
    /// The updater's own in-process rollback failed.
    RollbackFailed { error: String },
    /// An operator asked for a restore.
    OperatorRequested,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::UnexpectedCode { code } => write!(f, "exited with unexpected code {}", code),
            ExitReason::Signaled { signal } => write!(f, "killed by signal {}", signal),
            ExitReason::StartupTimeout { after_secs } => {
                write!(f, "not ready after {}s", after_secs)
            }
            ExitReason::ExitedBeforeReady { code: Some(code) } => {
                write!(f, "exited with code {} before ready", code)
            }
            ExitReason::ExitedBeforeReady { code: None } => write!(f, "exited before ready"),
            ExitReason::UnknownStatus => write!(f, "exited with unknown status"),
            ExitReason::RollbackFailed { error } => write!(f, "in-process rollback failed: {}", error),
            ExitReason::OperatorRequested => write!(f, "restore requested by operator"),
        }
    }
}

/// Pointer into the journal at the time of failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalReference {
    pub session_id: Option<SessionId>,
    pub batch_count: usize,
    pub top_batch_id: Option<BatchId>,
}

impl JournalReference {
    pub fn of(snapshot: &JournalSnapshot) -> Self {
        Self {
            session_id: snapshot.session_id.clone(),
            batch_count: snapshot.batches.len(),
            top_batch_id: snapshot.top().map(|e| e.id),
        }
    }
}

/// Written once per failure, deleted after a successful restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub target_id: TargetId,
    pub exit_reason: ExitReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics_path: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
    pub host_id: String,
    pub journal_reference: JournalReference,
}

impl FailureRecord {
    pub fn new(target_id: TargetId, exit_reason: ExitReason, journal: &JournalSnapshot) -> Self {
        Self {
            target_id,
            exit_reason,
            pid: None,
            diagnostics_path: None,
            timestamp: Utc::now(),
            host_id: crate::logging::get_host_id(),
            journal_reference: JournalReference::of(journal),
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_diagnostics(mut self, path: Option<PathBuf>) -> Self {
        self.diagnostics_path = path;
        self
    }
}
