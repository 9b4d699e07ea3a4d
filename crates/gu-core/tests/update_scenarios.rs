//! End-to-end update sessions against a real install directory.

mod support;

use gu_common::{SessionId, TargetId};
use gu_core::events::{event_names as progress, ProgressEmitter, ProgressEvent};
use gu_core::journal::Journal;
use gu_core::operation::Batch;
use gu_core::platform::PlatformStrategy;
use gu_core::recovery::{CycleOutcome, ExitReason, FailureFlag, FailureRecord, FlagState, RecoveryAgent};
use gu_core::store::StateStore;
use gu_core::{source, AbortReason, CancelToken, SessionOutcome, UpdateEngine};
use std::fs;
use std::sync::{Arc, Mutex};
use support::{labelled_op, Fixture, TracingInterpreter};

#[derive(Default)]
struct Capture {
    events: Mutex<Vec<ProgressEvent>>,
}

impl Capture {
    fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event.clone())
            .collect()
    }
}

impl ProgressEmitter for Capture {
    fn emit(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn engine(fixture: &Fixture) -> UpdateEngine {
    let config = fixture.config();
    let source = source::from_config(&config.source);
    UpdateEngine::new(config, PlatformStrategy::for_host().unwrap(), source)
}

fn target(fixture: &Fixture) -> TargetId {
    let config = fixture.config();
    TargetId::for_install(&config.app.name, &config.paths.install_dir)
}

#[test]
fn digest_mismatch_aborts_as_corruption_with_empty_journal() {
    let mut fixture = Fixture::new();
    fixture.install("a.txt", b"a1");
    fixture.publish("1.1.0", &[("a.txt", b"a2", 0o644)], true);

    let engine = engine(&fixture).without_launch();
    let capture = Arc::new(Capture::default());
    engine.register_observer(capture.clone());
    let report = engine.run(&CancelToken::new());

    assert_eq!(report.outcome, SessionOutcome::Aborted(AbortReason::Corruption));
    assert_eq!(report.batches_committed, 0);
    assert!(engine.open_journal().unwrap().is_empty());
    assert_eq!(fixture.read_installed("a.txt"), b"a1");
    assert!(FailureFlag::new(engine.store(), &report.target_id)
        .load()
        .unwrap()
        .is_clear());

    let names = capture.names();
    assert_eq!(names.first().map(String::as_str), Some(progress::UPDATE_CHECK_STARTED));
    assert_eq!(names.last().map(String::as_str), Some(progress::SESSION_ABORTED));
    assert!(!names.iter().any(|n| n == progress::BACKUP_COMMITTED));
}

#[test]
fn apply_failure_restores_originals_and_empties_journal() {
    let mut fixture = Fixture::new();
    fixture.install("a.txt", b"a1");
    fixture.install("b.txt", b"b1");
    // A non-empty directory where the package ships a file: replacing it fails.
    fs::create_dir_all(fixture.install_dir().join("c.txt/inner")).unwrap();
    fixture.publish(
        "1.1.0",
        &[("a.txt", b"a2", 0o644), ("b.txt", b"b2", 0o644), ("c.txt", b"c2", 0o644)],
        false,
    );

    let engine = engine(&fixture).without_launch();
    let report = engine.run(&CancelToken::new());

    assert_eq!(report.outcome, SessionOutcome::Aborted(AbortReason::ApplyFailure));
    assert_eq!(report.batches_committed, 2);
    let rollback = report.rollback.as_ref().expect("rollback ran");
    assert_eq!(rollback.batches, 2);
    assert!(rollback.error.is_none());

    assert_eq!(fixture.read_installed("a.txt"), b"a1");
    assert_eq!(fixture.read_installed("b.txt"), b"b1");
    assert!(fixture.install_dir().join("c.txt/inner").is_dir());
    assert!(!fixture
        .install_dir()
        .join(gu_core::pipeline::VERSION_MARKER)
        .exists());
    assert!(engine.open_journal().unwrap().is_empty());
    assert!(FailureFlag::new(engine.store(), &report.target_id)
        .load()
        .unwrap()
        .is_clear());
}

#[test]
fn successful_update_then_up_to_date() {
    let mut fixture = Fixture::new();
    fixture.install("a.txt", b"a1");
    fixture.publish("1.1.0", &[("a.txt", b"a2", 0o644), ("new/d.txt", b"d", 0o644)], false);

    let engine = engine(&fixture).without_launch();
    let report = engine.run(&CancelToken::new());
    assert!(report.updated(), "{:?}", report.error);
    assert_eq!(report.to_version.as_deref(), Some("1.1.0"));
    assert_eq!(fixture.read_installed("a.txt"), b"a2");
    assert_eq!(fixture.read_installed("new/d.txt"), b"d");
    assert_eq!(engine.current_version(), "1.1.0");
    // Committed batches stay journaled so a later crash can still be restored.
    assert_eq!(engine.open_journal().unwrap().len(), 2);

    let again = engine.run(&CancelToken::new());
    assert!(again.succeeded());
    assert!(!again.updated());
    assert_eq!(fixture.read_installed("a.txt"), b"a2");
}

#[test]
fn raised_flag_blocks_new_sessions() {
    let mut fixture = Fixture::new();
    fixture.install("a.txt", b"a1");
    fixture.publish("1.1.0", &[("a.txt", b"a2", 0o644)], false);

    let engine = engine(&fixture).without_launch();
    let target = engine.target_id();
    let journal = engine.open_journal().unwrap();
    let record = FailureRecord::new(target.clone(), ExitReason::Signaled { signal: 11 }, journal.snapshot());
    drop(journal);
    FailureFlag::new(engine.store(), &target).raise(&record).unwrap();

    let report = engine.run(&CancelToken::new());
    assert_eq!(report.outcome, SessionOutcome::Aborted(AbortReason::RecoveryPending));
    assert_eq!(fixture.read_installed("a.txt"), b"a1");
}

#[test]
fn journal_write_failure_touches_nothing() {
    let mut fixture = Fixture::new();
    fixture.install("a.txt", b"a1");
    fixture.publish("1.1.0", &[("a.txt", b"a2", 0o644)], false);

    let engine = engine(&fixture).without_launch();
    let mut journal = engine.open_journal().unwrap();
    let journal_path = engine.store().journal_path(&engine.target_id());
    fs::create_dir_all(journal_path.join("blocked")).unwrap();

    let report = engine.run_with_journal(&mut journal, &CancelToken::new());
    assert_eq!(
        report.outcome,
        SessionOutcome::Aborted(AbortReason::JournalWriteFailure)
    );
    assert_eq!(report.batches_committed, 0);
    assert_eq!(fixture.read_installed("a.txt"), b"a1");
}

#[cfg(unix)]
#[test]
fn crash_after_launch_raises_flag_and_agent_restores() {
    use gu_core::watchdog::WatchOutcome;
    use gu_core::Watchdog;

    let mut fixture = Fixture::new();
    fixture.install("app.sh", b"#!/bin/sh\nexit 0\n");
    fixture.install("data.txt", b"d1");
    fixture.publish(
        "1.1.0",
        &[("app.sh", b"#!/bin/sh\nexit 3\n", 0o755), ("data.txt", b"d2", 0o644)],
        false,
    );

    let engine = engine(&fixture);
    let mut report = engine.run(&CancelToken::new());
    assert!(report.updated(), "{:?}", report.error);
    let handle = report.process.take().expect("target launched");
    let target = report.target_id.clone();

    let watchdog = Watchdog::new(engine.store(), engine.config()).with_version("editor", "1.1.0");
    let record = match watchdog.supervise(&target, handle).unwrap() {
        WatchOutcome::Failed { record } => record,
        other => panic!("expected a failure, got {:?}", other),
    };
    assert!(matches!(
        record.exit_reason,
        ExitReason::ExitedBeforeReady { code: Some(3) } | ExitReason::UnexpectedCode { code: 3 }
    ));

    let flag = FailureFlag::new(engine.store(), &target);
    assert!(matches!(flag.load().unwrap(), FlagState::Raised { .. }));
    assert!(flag.record().unwrap().is_some());
    assert_eq!(fixture.read_installed("data.txt"), b"d2");

    let strategy = PlatformStrategy::for_host().unwrap();
    let outcome = RecoveryAgent::new(engine.store(), &strategy)
        .run_cycle(&target)
        .unwrap();
    assert!(matches!(outcome, CycleOutcome::Restored { batches: 2, .. }), "{:?}", outcome);
    assert_eq!(fixture.read_installed("data.txt"), b"d1");
    assert_eq!(fixture.read_installed("app.sh"), b"#!/bin/sh\nexit 0\n");
    assert!(flag.load().unwrap().is_clear());
    assert!(flag.record().unwrap().is_none());
    assert!(engine.open_journal().unwrap().is_empty());
}

#[test]
fn agent_resumes_interrupted_restore_after_restart() {
    let fixture = Fixture::new();
    let store = StateStore::new(fixture.state_dir());
    let target = target(&fixture);

    let mut journal = Journal::open(&store, &target).unwrap();
    let session = SessionId::new();
    for stage in ["backup", "apply", "drivers"] {
        let mut batch = Batch::new(stage, session.clone());
        batch.push(labelled_op(&format!("{}-1", stage)));
        batch.push(labelled_op(&format!("{}-2", stage)));
        journal.push(&mut batch).unwrap();
    }
    let record = FailureRecord::new(target.clone(), ExitReason::Signaled { signal: 9 }, journal.snapshot());
    let flag = FailureFlag::new(&store, &target);
    flag.raise(&record).unwrap();

    // First attempt: moved to InRestore, undid and popped the top batch, then the machine went down.
    flag.begin_restore().unwrap();
    journal.pop().unwrap();
    drop(journal);
    assert!(matches!(flag.load().unwrap(), FlagState::InRestore { attempts: 1, .. }));

    // After restart: fresh handles on the same state directory.
    let store = StateStore::new(fixture.state_dir());
    let interp = TracingInterpreter::default();
    let outcome = RecoveryAgent::new(&store, &interp).run_cycle(&target).unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Restored {
            batches: 2,
            operations: 4
        }
    );
    assert_eq!(
        interp.undo_calls(),
        vec!["undo:apply-2", "undo:apply-1", "undo:backup-2", "undo:backup-1"]
    );
    assert!(Journal::open(&store, &target).unwrap().is_empty());
    assert!(FailureFlag::new(&store, &target).load().unwrap().is_clear());
}
