//! Property tests for the rollback guarantees: journal-before-mutate,
//! LIFO restore, idempotent restore, single restorer, and fail-closed
//! journal writes.

mod support;

use gu_common::{SessionId, TargetId};
use gu_core::executor::{Executor, InterpretError, OperationInterpreter};
use gu_core::journal::{Journal, JournalSnapshot};
use gu_core::operation::{Batch, OperationStatus, UndoPayload};
use gu_core::recovery::{CycleOutcome, ExitReason, FailureFlag, FailureRecord, RecoveryAgent};
use gu_core::store::StateStore;
use gu_core::{CancelToken, Operation};
use proptest::prelude::*;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use support::{labelled_op, TracingInterpreter};
use tempfile::TempDir;

fn names_strategy() -> impl Strategy<Value = Vec<Vec<String>>> {
    prop::collection::vec(prop::collection::vec("[a-z]{1,8}", 1..5), 1..6)
}

fn push_batches(journal: &mut Journal, batches: &[Vec<String>]) -> Vec<Batch> {
    let session = SessionId::new();
    batches
        .iter()
        .enumerate()
        .map(|(i, names)| {
            let mut batch = Batch::new(format!("stage{}", i), session.clone());
            for (j, name) in names.iter().enumerate() {
                batch.push(labelled_op(&format!("b{}/{}-{}", i, j, name)));
            }
            journal.push(&mut batch).expect("push");
            batch
        })
        .collect()
}

/// Fails the test if an operation runs before its batch is on disk.
struct JournalWitness {
    journal_path: PathBuf,
    violations: Mutex<Vec<String>>,
    forwards: Mutex<usize>,
}

impl OperationInterpreter for JournalWitness {
    fn forward(&self, op: &Operation) -> Result<(), InterpretError> {
        if let Ok(mut n) = self.forwards.lock() {
            *n += 1;
        }
        let durable = fs::read(&self.journal_path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<JournalSnapshot>(&bytes).ok())
            .is_some_and(|snapshot| {
                snapshot
                    .batches
                    .iter()
                    .any(|entry| entry.operations.iter().any(|rec| rec.artifact_id == op.artifact_id))
            });
        if !durable {
            if let Ok(mut v) = self.violations.lock() {
                v.push(op.artifact_id.clone());
            }
        }
        Ok(())
    }

    fn undo(&self, _undo: &UndoPayload) -> Result<(), InterpretError> {
        Ok(())
    }
}

fn raise(store: &StateStore, target: &TargetId) {
    let journal = Journal::open(store, target).expect("open");
    let record = FailureRecord::new(
        target.clone(),
        ExitReason::UnexpectedCode { code: 3 },
        journal.snapshot(),
    );
    FailureFlag::new(store, target).raise(&record).expect("raise");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// No operation is marked done, or even started, before its batch is durable.
    #[test]
    fn operations_run_only_after_commit_is_durable(batches in names_strategy()) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let target = TargetId::from_name("editor");
        let mut journal = Journal::open(&store, &target).unwrap();
        let witness = JournalWitness {
            journal_path: store.journal_path(&target),
            violations: Mutex::new(Vec::new()),
            forwards: Mutex::new(0),
        };
        let executor = Executor::new(&witness);
        let session = SessionId::new();

        for (i, names) in batches.iter().enumerate() {
            let mut batch = Batch::new(format!("stage{}", i), session.clone());
            for (j, name) in names.iter().enumerate() {
                batch.push(labelled_op(&format!("b{}/{}-{}", i, j, name)));
            }
            // Uncommitted batches are refused outright.
            prop_assert!(executor.run_forward(&mut batch, &CancelToken::new()).is_err());
            prop_assert!(batch.operations().iter().all(|op| op.status == OperationStatus::Pending));

            journal.push(&mut batch).unwrap();
            executor.run_forward(&mut batch, &CancelToken::new()).unwrap();
            prop_assert!(batch.operations().iter().all(|op| op.status == OperationStatus::Done));
        }

        let total: usize = batches.iter().map(|b| b.len()).sum();
        prop_assert_eq!(*witness.forwards.lock().unwrap(), total);
        prop_assert!(witness.violations.lock().unwrap().is_empty());
    }

    /// The recovery agent undoes batches newest first, operations last first.
    #[test]
    fn restore_undoes_batches_in_reverse_commit_order(batches in names_strategy()) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let target = TargetId::from_name("editor");
        let mut journal = Journal::open(&store, &target).unwrap();
        let committed = push_batches(&mut journal, &batches);
        drop(journal);

        raise(&store, &target);
        let interp = TracingInterpreter::default();
        let outcome = RecoveryAgent::new(&store, &interp).run_cycle(&target).unwrap();

        let expected: Vec<String> = committed
            .iter()
            .rev()
            .flat_map(|batch| {
                batch
                    .operations()
                    .iter()
                    .rev()
                    .map(|op| format!("undo:{}", op.artifact_id))
                    .collect::<Vec<_>>()
            })
            .collect();
        prop_assert_eq!(interp.undo_calls(), expected.clone());
        prop_assert_eq!(
            outcome,
            CycleOutcome::Restored { batches: batches.len(), operations: expected.len() }
        );
        prop_assert!(Journal::open(&store, &target).unwrap().is_empty());
        prop_assert!(FailureFlag::new(&store, &target).load().unwrap().is_clear());
    }

    /// When the journal cannot be written, nothing in the batch executes.
    #[test]
    fn failed_push_keeps_batch_from_running(names in prop::collection::vec("[a-z]{1,8}", 1..6)) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let target = TargetId::from_name("editor");
        let mut journal = Journal::open(&store, &target).unwrap();

        // A non-empty directory where the journal lives makes every write fail.
        fs::create_dir_all(store.journal_path(&target).join("blocked")).unwrap();

        let mut batch = Batch::new("apply", SessionId::new());
        for name in &names {
            batch.push(labelled_op(name));
        }
        prop_assert!(journal.push(&mut batch).is_err());
        prop_assert!(!batch.is_committed());

        let interp = TracingInterpreter::default();
        let err = Executor::new(&interp)
            .run_forward(&mut batch, &CancelToken::new())
            .unwrap_err();
        prop_assert_eq!(err.class(), gu_common::FailureClass::JournalWriteFailure);
        prop_assert!(interp.calls().is_empty());
    }
}

#[test]
fn restore_on_empty_journal_is_a_successful_noop_twice() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::new(dir.path());
    let target = TargetId::from_name("editor");
    let interp = TracingInterpreter::default();
    let agent = RecoveryAgent::new(&store, &interp);

    for _ in 0..2 {
        assert!(agent.request_restore(&target).unwrap());
        assert_eq!(
            agent.run_cycle(&target).unwrap(),
            CycleOutcome::Restored {
                batches: 0,
                operations: 0
            }
        );
        assert!(FailureFlag::new(&store, &target).load().unwrap().is_clear());
    }
    // With the flag clear a cycle is idle, which is also success.
    assert_eq!(agent.run_cycle(&target).unwrap(), CycleOutcome::Idle);
    assert!(interp.calls().is_empty());
}

#[cfg(feature = "server")]
#[test]
fn restore_endpoint_on_empty_journal_succeeds_twice() {
    use gu_core::server::handle_restore;

    let dir = TempDir::new().unwrap();
    let store = StateStore::new(dir.path().join("state"));
    let install = dir.path().join("install");
    fs::create_dir_all(&install).unwrap();
    let body = serde_json::json!({
        "journal": JournalSnapshot::empty(TargetId::from_name("editor")),
        "targetDirectory": install,
    });
    let body = serde_json::to_vec(&body).unwrap();
    let interp = TracingInterpreter::default();

    for _ in 0..2 {
        let response = handle_restore(&body, &store, &dir.path().join("backups"), &interp);
        assert_eq!(response.status, 200);
    }
    assert!(interp.calls().is_empty());
}

#[test]
fn concurrent_raise_and_poll_never_overlap_restores() {
    for round in 0..8 {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let target = TargetId::from_name("editor");
        let mut journal = Journal::open(&store, &target).unwrap();
        let batches: Vec<Vec<String>> = (0..3)
            .map(|i| (0..3).map(|j| format!("r{}-{}-{}", round, i, j)).collect())
            .collect();
        push_batches(&mut journal, &batches);
        drop(journal);

        let interp = TracingInterpreter::with_undo_delay(Duration::from_millis(2));
        let outcomes = Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            // Watchdog side: raise, then try to restore right away.
            scope.spawn(|| {
                raise(&store, &target);
                let outcome = RecoveryAgent::new(&store, &interp).run_cycle(&target).unwrap();
                outcomes.lock().unwrap().push(outcome);
            });
            // Agent side: keep polling.
            for _ in 0..2 {
                scope.spawn(|| {
                    for _ in 0..20 {
                        let outcome = RecoveryAgent::new(&store, &interp).run_cycle(&target).unwrap();
                        outcomes.lock().unwrap().push(outcome);
                        std::thread::sleep(Duration::from_millis(1));
                    }
                });
            }
        });

        assert_eq!(interp.max_concurrent_undo(), 1, "restores overlapped");
        assert_eq!(interp.undo_calls().len(), 9, "every operation undone exactly once");
        let restored = outcomes
            .lock()
            .unwrap()
            .iter()
            .filter(|o| matches!(o, CycleOutcome::Restored { .. }))
            .count();
        assert_eq!(restored, 1);
        assert!(Journal::open(&store, &target).unwrap().is_empty());
        assert!(FailureFlag::new(&store, &target).load().unwrap().is_clear());
    }
}
