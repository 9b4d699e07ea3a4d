//! Failure flag, failure record, and the recovery agent.
//!
//! The watchdog (or a failed in-process rollback) raises the flag; the
//! recovery agent observes it, restores the journal in LIFO order, and
//! clears it. A restore that fails part-way leaves the flag `InRestore`
//! with the remaining batches still journaled, so the next cycle resumes.

mod agent;
mod flag;
mod record;

pub use agent::{CycleOutcome, RecoveryAgent};
pub use flag::{FailureFlag, FlagState};
pub use record::{ExitReason, FailureRecord, JournalReference};

use crate::journal::JournalError;
use crate::lock::LockError;
use crate::store::StoreError;
use gu_common::{BatchId, FailureClass};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("undo of batch {batch} failed: {message}")]
    Undo { batch: BatchId, message: String },
}

impl RecoveryError {
    pub fn class(&self) -> FailureClass {
        match self {
            RecoveryError::Store(_) | RecoveryError::Lock(_) => FailureClass::TransientIo,
            RecoveryError::Journal(e) => e.class(),
            RecoveryError::Undo { .. } => FailureClass::UndoFailure,
        }
    }
}

impl From<RecoveryError> for gu_common::Error {
    fn from(err: RecoveryError) -> Self {
        match err {
            RecoveryError::Lock(e) => e.into(),
            RecoveryError::Journal(e) => e.into(),
            RecoveryError::Undo { .. } => gu_common::Error::Undo(err.to_string()),
            RecoveryError::Store(e) => gu_common::Error::Io(std::io::Error::other(e.to_string())),
        }
    }
}
