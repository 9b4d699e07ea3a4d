//! Independent recovery agent.
//!
//! One cycle per target: observe the flag, take the restore lock, move the
//! flag to `InRestore`, then undo journaled batches newest first. Each
//! batch is undone before it is popped, so a crash between the two only
//! repeats idempotent undo steps on the next cycle.

use super::{ExitReason, FailureFlag, FailureRecord, FlagState, RecoveryError};
use crate::executor::{Executor, OperationInterpreter};
use crate::journal::Journal;
use crate::lock::LockError;
use crate::logging::event_names;
use crate::store::{LockKind, StateStore};
use gu_common::{BatchId, TargetId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Result of one restore cycle for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Flag clear; nothing to do.
    Idle,
    /// Another restorer holds the restore lock.
    Busy,
    /// The journal was fully undone and the flag cleared.
    Restored { batches: usize, operations: usize },
    /// Undo failed; the flag stays `InRestore` and `remaining` batches are journaled.
    Failed { error: String, remaining: usize },
}

pub struct RecoveryAgent<'a> {
    store: StateStore,
    interpreter: &'a dyn OperationInterpreter,
    poll_interval: Duration,
}

impl<'a> RecoveryAgent<'a> {
    pub fn new(store: &StateStore, interpreter: &'a dyn OperationInterpreter) -> Self {
        Self {
            store: store.clone(),
            interpreter,
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Raise the flag on an operator's behalf, keeping any existing record.
    pub fn request_restore(&self, target: &TargetId) -> Result<bool, RecoveryError> {
        let journal = Journal::open(&self.store, target)?;
        let record = FailureRecord::new(target.clone(), ExitReason::OperatorRequested, journal.snapshot());
        FailureFlag::new(&self.store, target).raise(&record)
    }

    /// One observe-and-restore pass over `target`.
    pub fn run_cycle(&self, target: &TargetId) -> Result<CycleOutcome, RecoveryError> {
        let flag = FailureFlag::new(&self.store, target);
        if flag.load()?.is_clear() {
            return Ok(CycleOutcome::Idle);
        }

        let _restore_lock = match self.store.try_lock(target, LockKind::Restore) {
            Ok(lock) => lock,
            Err(LockError::Unavailable(_)) => {
                debug!(
                    target: event_names::RECOVERY_SKIPPED,
                    target_id = %target,
                    "restore already in progress"
                );
                return Ok(CycleOutcome::Busy);
            }
            Err(e) => return Err(e.into()),
        };

        let attempts = match flag.begin_restore()? {
            Some(FlagState::InRestore { attempts, .. }) => attempts,
            // Cleared between the first look and the lock.
            _ => return Ok(CycleOutcome::Idle),
        };

        let mut journal = match Journal::open(&self.store, target) {
            Ok(journal) => journal,
            Err(e) => {
                flag.restore_failed(&e.to_string())?;
                error!(
                    target: event_names::RECOVERY_FAILED,
                    target_id = %target,
                    error = %e,
                    "journal unreadable; restore needs manual intervention"
                );
                return Ok(CycleOutcome::Failed {
                    error: e.to_string(),
                    remaining: 0,
                });
            }
        };

        info!(
            target: event_names::RECOVERY_STARTED,
            target_id = %target,
            batches = journal.len(),
            attempt = attempts,
            "restoring target"
        );

        match self.unwind(&mut journal) {
            Ok((batches, operations)) => {
                flag.clear()?;
                info!(
                    target: event_names::RECOVERY_FINISHED,
                    target_id = %target,
                    batches,
                    operations,
                    "target restored"
                );
                Ok(CycleOutcome::Restored { batches, operations })
            }
            Err(e) => {
                let message = e.to_string();
                flag.restore_failed(&message)?;
                error!(
                    target: event_names::RECOVERY_FAILED,
                    target_id = %target,
                    error = %message,
                    remaining = journal.len(),
                    "restore failed; will retry"
                );
                Ok(CycleOutcome::Failed {
                    error: message,
                    remaining: journal.len(),
                })
            }
        }
    }

    /// Peek, undo, pop until the journal is empty.
    fn unwind(&self, journal: &mut Journal) -> Result<(usize, usize), RecoveryError> {
        let executor = Executor::new(self.interpreter);
        let mut batches = 0;
        let mut operations = 0;
        while let Some(mut batch) = journal.peek() {
            let id = batch.id.unwrap_or(BatchId(0));
            operations += executor
                .run_backward(&mut batch)
                .map_err(|e| RecoveryError::Undo {
                    batch: id,
                    message: e.to_string(),
                })?;
            journal.pop()?;
            batches += 1;
            debug!(
                target: event_names::RECOVERY_BATCH_UNDONE,
                target_id = %journal.target(),
                batch = %id,
                stage = %batch.stage,
                "batch undone"
            );
        }
        Ok((batches, operations))
    }

    /// One cycle over every known target.
    pub fn run_all(&self) -> Result<Vec<(TargetId, CycleOutcome)>, RecoveryError> {
        let mut outcomes = Vec::new();
        for target in self.store.list_targets()? {
            match self.run_cycle(&target) {
                Ok(outcome) => outcomes.push((target, outcome)),
                Err(e) => {
                    warn!(target_id = %target, error = %e, "recovery cycle error");
                    outcomes.push((
                        target,
                        CycleOutcome::Failed {
                            error: e.to_string(),
                            remaining: 0,
                        },
                    ));
                }
            }
        }
        Ok(outcomes)
    }

    /// Poll every target until `shutdown` is set.
    ///
    /// A failed pass (state root unreadable, say) is logged and retried on
    /// the next tick; only `shutdown` ends the loop.
    pub fn run_forever(&self, shutdown: &AtomicBool) {
        info!(
            poll_secs = self.poll_interval.as_secs_f64(),
            state_dir = %self.store.root().display(),
            "recovery agent running"
        );
        while !shutdown.load(Ordering::Relaxed) {
            match self.run_all() {
                Ok(outcomes) => debug!(
                    target: event_names::RECOVERY_CYCLE,
                    targets = outcomes.len(),
                    "cycle complete"
                ),
                Err(e) => error!(
                    target: event_names::RECOVERY_CYCLE,
                    state_dir = %self.store.root().display(),
                    error = %e,
                    "recovery pass failed; retrying next tick"
                ),
            }
            let mut waited = Duration::ZERO;
            while waited < self.poll_interval && !shutdown.load(Ordering::Relaxed) {
                let step = Duration::from_millis(100).min(self.poll_interval - waited);
                std::thread::sleep(step);
                waited += step;
            }
        }
        info!("recovery agent stopped");
    }
}
