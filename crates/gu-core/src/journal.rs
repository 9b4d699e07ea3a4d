//! Durable LIFO journal of committed batches.
//!
//! The whole stack is persisted as one JSON snapshot and replaced
//! atomically on every push and pop. A batch counts as committed only
//! after its snapshot is durable; a failed push leaves both the file and
//! the in-memory stack unchanged.
//!
//! The journal is scoped to one update session. Starting a new session
//! archives a non-empty previous journal as `journal.<session>.json` and
//! prunes archives beyond the retention count.

use crate::logging::event_names;
use crate::operation::{Batch, OperationKind, UndoPayload};
use crate::store::{StateStore, StoreError};
use chrono::{DateTime, Utc};
use gu_common::{BatchId, FailureClass, SessionId, TargetId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const JOURNAL_SCHEMA_VERSION: &str = "1.0.0";

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal write failed: {0}")]
    Write(#[source] StoreError),

    #[error("journal unreadable: {0}")]
    Read(#[source] StoreError),

    #[error("journal schema {found} is not supported (expected {expected})")]
    SchemaMismatch { found: String, expected: String },

    #[error("journal belongs to target {found}, expected {expected}")]
    TargetMismatch { found: String, expected: String },

    #[error("batch is already committed as {0}")]
    AlreadyCommitted(BatchId),

    #[error("refusing to push an empty batch")]
    EmptyBatch,
}

impl JournalError {
    pub fn class(&self) -> FailureClass {
        match self {
            JournalError::Write(_) | JournalError::AlreadyCommitted(_) | JournalError::EmptyBatch => {
                FailureClass::JournalWriteFailure
            }
            JournalError::Read(_)
            | JournalError::SchemaMismatch { .. }
            | JournalError::TargetMismatch { .. } => FailureClass::Corruption,
        }
    }
}

impl From<JournalError> for gu_common::Error {
    fn from(err: JournalError) -> Self {
        match err.class() {
            FailureClass::JournalWriteFailure => gu_common::Error::JournalWrite(err.to_string()),
            _ => gu_common::Error::JournalCorrupted(err.to_string()),
        }
    }
}

/// One operation as recorded in the journal: enough to undo it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub kind: OperationKind,
    pub artifact_id: String,
    pub undo: UndoPayload,
}

/// One committed batch as recorded in the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: BatchId,
    pub stage: String,
    pub session_id: SessionId,
    pub committed_at: DateTime<Utc>,
    pub operations: Vec<OperationRecord>,
}

impl JournalEntry {
    fn from_batch(id: BatchId, batch: &Batch) -> Self {
        Self {
            id,
            stage: batch.stage.clone(),
            session_id: batch.session_id.clone(),
            committed_at: Utc::now(),
            operations: batch
                .operations()
                .iter()
                .map(|op| OperationRecord {
                    kind: op.kind,
                    artifact_id: op.artifact_id.clone(),
                    undo: op.undo.clone(),
                })
                .collect(),
        }
    }

    /// Committed batch with every operation marked done.
    pub fn to_batch(&self) -> Batch {
        Batch::from_journal(
            self.id,
            self.stage.clone(),
            self.session_id.clone(),
            self.operations
                .iter()
                .map(|r| (r.kind, r.artifact_id.clone(), r.undo.clone())),
        )
    }
}

/// Serialized journal. `batches` is bottom-first; the last entry is the top.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalSnapshot {
    pub schema_version: String,
    pub target_id: TargetId,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub next_batch_id: BatchId,
    #[serde(default)]
    pub batches: Vec<JournalEntry>,
}

impl JournalSnapshot {
    pub fn empty(target_id: TargetId) -> Self {
        Self {
            schema_version: JOURNAL_SCHEMA_VERSION.to_string(),
            target_id,
            session_id: None,
            next_batch_id: BatchId(1),
            batches: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn top(&self) -> Option<&JournalEntry> {
        self.batches.last()
    }

    pub fn validate(&self) -> Result<(), JournalError> {
        let major = |v: &str| v.split('.').next().map(str::to_string);
        if major(&self.schema_version) != major(JOURNAL_SCHEMA_VERSION) {
            return Err(JournalError::SchemaMismatch {
                found: self.schema_version.clone(),
                expected: JOURNAL_SCHEMA_VERSION.to_string(),
            });
        }
        Ok(())
    }
}

/// Handle on one target's live journal.
#[derive(Debug)]
pub struct Journal {
    store: StateStore,
    target: TargetId,
    path: PathBuf,
    snapshot: JournalSnapshot,
}

impl Journal {
    /// Load the target's journal, or start an empty one.
    pub fn open(store: &StateStore, target: &TargetId) -> Result<Self, JournalError> {
        let path = store.journal_path(target);
        let snapshot = match store
            .read_json::<JournalSnapshot>(&path)
            .map_err(JournalError::Read)?
        {
            Some(snapshot) => {
                snapshot.validate()?;
                if &snapshot.target_id != target {
                    return Err(JournalError::TargetMismatch {
                        found: snapshot.target_id.to_string(),
                        expected: target.to_string(),
                    });
                }
                snapshot
            }
            None => JournalSnapshot::empty(target.clone()),
        };
        debug!(target_id = %target, batches = snapshot.batches.len(), "journal opened");
        Ok(Self {
            store: store.clone(),
            target: target.clone(),
            path,
            snapshot,
        })
    }

    pub fn target(&self) -> &TargetId {
        &self.target
    }

    pub fn snapshot(&self) -> &JournalSnapshot {
        &self.snapshot
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.is_empty()
    }

    pub fn len(&self) -> usize {
        self.snapshot.batches.len()
    }

    /// Start a new session: archive a non-empty journal and reset.
    ///
    /// Callers must have checked that no failure is pending; a journal that
    /// still needs restoring must not be archived.
    pub fn begin_session(&mut self, session: &SessionId, retention: usize) -> Result<(), JournalError> {
        if !self.snapshot.is_empty() {
            let archive_name = self
                .snapshot
                .session_id
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("unscoped-{}", Utc::now().format("%Y%m%d-%H%M%S-%3f")));
            let archive = self.store.archived_journal_path(&self.target, &archive_name);
            self.store
                .write_json_atomic(&archive, &self.snapshot)
                .map_err(JournalError::Write)?;
            info!(
                target: event_names::JOURNAL_ARCHIVED,
                target_id = %self.target,
                archive = %archive.display(),
                batches = self.snapshot.batches.len(),
                "previous journal archived"
            );
            self.prune_archives(retention);
        }

        let mut next = JournalSnapshot::empty(self.target.clone());
        next.session_id = Some(session.clone());
        next.next_batch_id = self.snapshot.next_batch_id;
        self.persist(next)
    }

    fn prune_archives(&self, retention: usize) {
        let archives = match self.store.archived_journals(&self.target) {
            Ok(archives) => archives,
            Err(e) => {
                warn!(target_id = %self.target, error = %e, "cannot list journal archives");
                return;
            }
        };
        if archives.len() <= retention {
            return;
        }
        for old in &archives[..archives.len() - retention] {
            if let Err(e) = self.store.remove(old) {
                warn!(path = %old.display(), error = %e, "cannot prune journal archive");
            }
        }
    }

    /// Durably commit `batch` on top of the stack.
    ///
    /// On success the batch is marked `Committed` with its assigned id.
    /// On failure nothing changed: the batch stays open and must not run.
    pub fn push(&mut self, batch: &mut Batch) -> Result<BatchId, JournalError> {
        if let Some(id) = batch.id.filter(|_| batch.is_committed()) {
            return Err(JournalError::AlreadyCommitted(id));
        }
        if batch.is_empty() {
            return Err(JournalError::EmptyBatch);
        }

        let id = self.snapshot.next_batch_id;
        let mut next = self.snapshot.clone();
        next.batches.push(JournalEntry::from_batch(id, batch));
        next.next_batch_id = id.next();

        if let Err(e) = self.persist(next) {
            warn!(
                target: event_names::JOURNAL_WRITE_FAILED,
                target_id = %self.target,
                stage = %batch.stage,
                error = %e,
                "batch not committed"
            );
            return Err(e);
        }

        batch.mark_committed(id);
        debug!(
            target: event_names::JOURNAL_PUSHED,
            target_id = %self.target,
            batch = %id,
            stage = %batch.stage,
            operations = batch.len(),
            "batch committed"
        );
        Ok(id)
    }

    /// The top batch, without removing it.
    pub fn peek(&self) -> Option<Batch> {
        self.snapshot.top().map(JournalEntry::to_batch)
    }

    /// Durably remove the top batch and return it.
    pub fn pop(&mut self) -> Result<Option<Batch>, JournalError> {
        let mut next = self.snapshot.clone();
        let Some(entry) = next.batches.pop() else {
            return Ok(None);
        };
        self.persist(next)?;
        debug!(
            target: event_names::JOURNAL_POPPED,
            target_id = %self.target,
            batch = %entry.id,
            remaining = self.snapshot.batches.len(),
            "batch popped"
        );
        Ok(Some(entry.to_batch()))
    }

    fn persist(&mut self, next: JournalSnapshot) -> Result<(), JournalError> {
        self.store
            .write_json_atomic(&self.path, &next)
            .map_err(JournalError::Write)?;
        self.snapshot = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{ForwardPayload, Operation};
    use tempfile::TempDir;

    fn batch(stage: &str, session: &SessionId, names: &[&str]) -> Batch {
        let mut batch = Batch::new(stage, session.clone());
        for name in names {
            batch.push(Operation::new(
                OperationKind::Apply,
                *name,
                ForwardPayload::RemoveFile { path: name.into() },
                UndoPayload::RemoveFile { path: name.into() },
            ));
        }
        batch
    }

    fn setup() -> (TempDir, StateStore, TargetId) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        (dir, store, TargetId::from_name("editor"))
    }

    #[test]
    fn test_push_assigns_ids_and_persists() {
        let (_dir, store, target) = setup();
        let session = SessionId::new();
        let mut journal = Journal::open(&store, &target).unwrap();

        let mut b1 = batch("backup", &session, &["a"]);
        let mut b2 = batch("apply", &session, &["a", "b"]);
        assert_eq!(journal.push(&mut b1).unwrap(), BatchId(1));
        assert_eq!(journal.push(&mut b2).unwrap(), BatchId(2));
        assert_eq!(b2.id, Some(BatchId(2)));
        assert!(b2.is_committed());

        let reopened = Journal::open(&store, &target).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.peek().unwrap().id, Some(BatchId(2)));
    }

    #[test]
    fn test_pop_is_lifo() {
        let (_dir, store, target) = setup();
        let session = SessionId::new();
        let mut journal = Journal::open(&store, &target).unwrap();
        journal.push(&mut batch("backup", &session, &["a"])).unwrap();
        journal.push(&mut batch("apply", &session, &["a"])).unwrap();

        assert_eq!(journal.pop().unwrap().unwrap().stage, "apply");
        assert_eq!(journal.pop().unwrap().unwrap().stage, "backup");
        assert!(journal.pop().unwrap().is_none());
        assert!(Journal::open(&store, &target).unwrap().is_empty());
    }

    #[test]
    fn test_failed_push_leaves_batch_open() {
        let (_dir, store, target) = setup();
        let session = SessionId::new();
        let mut journal = Journal::open(&store, &target).unwrap();
        journal.push(&mut batch("backup", &session, &["a"])).unwrap();

        // Block the atomic rename with a non-empty directory.
        let path = store.journal_path(&target);
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir_all(path.join("blocker")).unwrap();

        let mut rejected = batch("apply", &session, &["b"]);
        let err = journal.push(&mut rejected).unwrap_err();
        assert!(!rejected.is_committed());
        assert_eq!(rejected.id, None);
        assert_eq!(err.class(), FailureClass::JournalWriteFailure);
        assert_eq!(journal.len(), 1);
    }

    #[test]
    fn test_empty_and_recommitted_batches_are_refused() {
        let (_dir, store, target) = setup();
        let session = SessionId::new();
        let mut journal = Journal::open(&store, &target).unwrap();
        assert!(matches!(
            journal.push(&mut Batch::new("apply", session.clone())),
            Err(JournalError::EmptyBatch)
        ));
        let mut committed = batch("apply", &session, &["a"]);
        journal.push(&mut committed).unwrap();
        assert!(matches!(
            journal.push(&mut committed),
            Err(JournalError::AlreadyCommitted(BatchId(1)))
        ));
        assert_eq!(journal.len(), 1);
    }

    #[test]
    fn test_begin_session_archives_and_prunes() {
        let (_dir, store, target) = setup();
        let mut journal = Journal::open(&store, &target).unwrap();

        let mut sessions = Vec::new();
        for i in 0..4 {
            let session = SessionId(format!("gu-2026010{}-000000-aaaa", i + 1));
            journal.begin_session(&session, 2).unwrap();
            journal.push(&mut batch("apply", &session, &["a"])).unwrap();
            sessions.push(session);
        }
        // Sessions 1..3 were archived; only the newest two are kept.
        let archives = store.archived_journals(&target).unwrap();
        assert_eq!(archives.len(), 2);
        assert!(archives[0].to_string_lossy().contains(sessions[1].as_str()));
        assert!(archives[1].to_string_lossy().contains(sessions[2].as_str()));

        assert_eq!(journal.len(), 1);
        assert_eq!(journal.snapshot().session_id.as_ref(), Some(&sessions[3]));
        // Ids stay monotonic across sessions.
        assert_eq!(journal.peek().unwrap().id, Some(BatchId(4)));
    }

    #[test]
    fn test_prune_drops_old_unscoped_archive_first() {
        let (_dir, store, target) = setup();
        let legacy = store.archived_journal_path(&target, "unscoped-20200101-000000-000");
        store
            .write_json_atomic(&legacy, &JournalSnapshot::empty(target.clone()))
            .unwrap();

        let mut journal = Journal::open(&store, &target).unwrap();
        let session = SessionId::new();
        journal.begin_session(&session, 1).unwrap();
        journal.push(&mut batch("apply", &session, &["a"])).unwrap();
        journal.begin_session(&SessionId::new(), 1).unwrap();

        let archives = store.archived_journals(&target).unwrap();
        assert_eq!(archives, vec![store.archived_journal_path(&target, session.as_str())]);
    }

    #[test]
    fn test_open_rejects_foreign_or_future_journal() {
        let (_dir, store, target) = setup();
        let mut foreign = JournalSnapshot::empty(TargetId::from_name("other"));
        store
            .write_json_atomic(&store.journal_path(&target), &foreign)
            .unwrap();
        assert!(matches!(
            Journal::open(&store, &target),
            Err(JournalError::TargetMismatch { .. })
        ));

        foreign.target_id = target.clone();
        foreign.schema_version = "2.0.0".into();
        store
            .write_json_atomic(&store.journal_path(&target), &foreign)
            .unwrap();
        let err = Journal::open(&store, &target).unwrap_err();
        assert_eq!(err.class(), FailureClass::Corruption);
    }

    #[test]
    fn test_corrupt_journal_is_corruption() {
        let (_dir, store, target) = setup();
        let path = store.journal_path(&target);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{\"batches\": [").unwrap();
        let err = Journal::open(&store, &target).unwrap_err();
        assert!(matches!(err, JournalError::Read(_)));
        assert_eq!(err.class(), FailureClass::Corruption);
    }
}
