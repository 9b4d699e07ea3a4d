//! Reversible operations and the batches that group them.
//!
//! An [`Operation`] carries both directions: the forward payload that
//! mutates the install, and the undo payload that reverses it. Undo
//! payloads are retry-safe: running one twice, or running one whose
//! forward never happened, leaves the same state as running it once.
//!
//! A [`Batch`] is the unit of journaling. It is mutable while `Open` and
//! becomes immutable once the journal has durably `Committed` it.

use gu_common::{BatchId, SessionId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What an operation does to the install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Copy a live file (or export a registered artifact) into the backup area.
    Backup,
    /// Replace or create a live file from the staged update.
    Apply,
    /// Register a platform artifact (driver) with the host.
    Install,
    /// Remove a live file the new version no longer ships.
    Delete,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationKind::Backup => "backup",
            OperationKind::Apply => "apply",
            OperationKind::Install => "install",
            OperationKind::Delete => "delete",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Done,
    Failed,
    Undone,
}

/// Forward half of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ForwardPayload {
    /// Atomically copy `from` over `to`.
    CopyFile { from: PathBuf, to: PathBuf },
    /// Remove `path` if present.
    RemoveFile { path: PathBuf },
    /// Register the artifact at `source` with the host under `name`.
    RegisterArtifact { name: String, source: PathBuf },
    /// Export the currently registered artifact `name` into `destination`.
    ExportArtifact { name: String, destination: PathBuf },
    /// Reloaded from the journal; the forward half is not replayable.
    Journaled,
}

/// Backward half of an operation. Every variant is retry-safe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UndoPayload {
    /// Copy `backup` over `target`. A missing backup is an error: the
    /// backup batch completes before any apply batch is journaled.
    RestoreFile { backup: PathBuf, target: PathBuf },
    /// Remove `path` if present.
    RemoveFile { path: PathBuf },
    /// Deregister `name`; re-register `reinstall` when that export exists.
    DeregisterArtifact {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reinstall: Option<PathBuf>,
    },
    Noop,
}

impl UndoPayload {
    /// Filesystem paths this undo touches.
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            UndoPayload::RestoreFile { backup, target } => vec![backup.as_path(), target.as_path()],
            UndoPayload::RemoveFile { path } => vec![path.as_path()],
            UndoPayload::DeregisterArtifact { reinstall, .. } => {
                reinstall.iter().map(|p| p.as_path()).collect()
            }
            UndoPayload::Noop => Vec::new(),
        }
    }
}

/// One reversible step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    /// Stable identifier of the artifact (relative path or driver name).
    pub artifact_id: String,
    pub forward: ForwardPayload,
    pub undo: UndoPayload,
    pub status: OperationStatus,
}

impl Operation {
    pub fn new(
        kind: OperationKind,
        artifact_id: impl Into<String>,
        forward: ForwardPayload,
        undo: UndoPayload,
    ) -> Self {
        Self {
            kind,
            artifact_id: artifact_id.into(),
            forward,
            undo,
            status: OperationStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitState {
    Open,
    Committed,
}

/// Execution progress of a committed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    NotStarted,
    Applied,
    Failed,
    RolledBack,
}

/// Ordered group of operations journaled as one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Assigned by the journal on push.
    pub id: Option<BatchId>,
    /// Pipeline stage that produced this batch (`backup`, `apply`).
    pub stage: String,
    pub session_id: SessionId,
    operations: Vec<Operation>,
    commit_state: CommitState,
    pub state: BatchState,
}

impl Batch {
    pub fn new(stage: impl Into<String>, session_id: SessionId) -> Self {
        Self {
            id: None,
            stage: stage.into(),
            session_id,
            operations: Vec::new(),
            commit_state: CommitState::Open,
            state: BatchState::NotStarted,
        }
    }

    /// Append an operation. Returns `false` (and drops it) once committed.
    pub fn push(&mut self, op: Operation) -> bool {
        if self.commit_state == CommitState::Committed {
            return false;
        }
        self.operations.push(op);
        true
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub(crate) fn operations_mut(&mut self) -> &mut [Operation] {
        &mut self.operations
    }

    pub fn commit_state(&self) -> CommitState {
        self.commit_state
    }

    pub fn is_committed(&self) -> bool {
        self.commit_state == CommitState::Committed
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Only the journal marks a batch committed.
    pub(crate) fn mark_committed(&mut self, id: BatchId) {
        self.id = Some(id);
        self.commit_state = CommitState::Committed;
    }

    /// Rebuild a committed batch from its journal record.
    ///
    /// Every operation is treated as done: the journal only knows the batch
    /// was committed, and undo payloads are safe to run over forwards that
    /// never ran.
    pub(crate) fn from_journal(
        id: BatchId,
        stage: String,
        session_id: SessionId,
        records: impl IntoIterator<Item = (OperationKind, String, UndoPayload)>,
    ) -> Self {
        let operations = records
            .into_iter()
            .map(|(kind, artifact_id, undo)| Operation {
                kind,
                artifact_id,
                forward: ForwardPayload::Journaled,
                undo,
                status: OperationStatus::Done,
            })
            .collect();
        Self {
            id: Some(id),
            stage,
            session_id,
            operations,
            commit_state: CommitState::Committed,
            state: BatchState::Applied,
        }
    }
}
