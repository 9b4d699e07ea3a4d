//! Forward and backward execution of committed batches.
//!
//! The executor never touches the journal. It refuses to run a batch the
//! journal has not committed, runs operations in order, and on the first
//! forward failure (or a cancellation between operations) undoes the
//! completed operations of that batch in reverse before reporting.

use crate::cancel::CancelToken;
use crate::operation::{Batch, BatchState, Operation, OperationStatus, UndoPayload};
use gu_common::FailureClass;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

/// Failure of a single forward or undo step.
#[derive(Debug, Error)]
pub enum InterpretError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("not supported on this platform: {0}")]
    Unsupported(String),

    #[error("forward step of {0} is not replayable")]
    NotReplayable(String),

    #[error("{0}")]
    Other(String),
}

impl InterpretError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        InterpretError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Performs the side effects an operation describes.
pub trait OperationInterpreter {
    fn forward(&self, op: &Operation) -> Result<(), InterpretError>;
    fn undo(&self, undo: &UndoPayload) -> Result<(), InterpretError>;
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("batch {stage} is not committed to the journal")]
    NotCommitted { stage: String },

    #[error("batch {stage} already ran ({state:?})")]
    AlreadyExecuted { stage: String, state: BatchState },

    #[error("{artifact}: {source}")]
    Forward {
        artifact: String,
        #[source]
        source: InterpretError,
        /// Undo failures hit while unwinding the batch.
        unwind_errors: Vec<String>,
    },

    #[error("cancelled after {completed} operation(s)")]
    Cancelled {
        completed: usize,
        unwind_errors: Vec<String>,
    },

    #[error("undo of {artifact} failed: {source}")]
    Undo {
        artifact: String,
        #[source]
        source: InterpretError,
    },
}

impl ExecutorError {
    pub fn class(&self) -> FailureClass {
        match self {
            ExecutorError::NotCommitted { .. } => FailureClass::JournalWriteFailure,
            ExecutorError::AlreadyExecuted { .. } | ExecutorError::Forward { .. } => {
                FailureClass::ApplyFailure
            }
            ExecutorError::Cancelled { .. } => FailureClass::Cancelled,
            ExecutorError::Undo { .. } => FailureClass::UndoFailure,
        }
    }

    /// Undo problems hit while unwinding; empty when the batch unwound cleanly.
    pub fn unwind_errors(&self) -> &[String] {
        match self {
            ExecutorError::Forward { unwind_errors, .. }
            | ExecutorError::Cancelled { unwind_errors, .. } => unwind_errors,
            _ => &[],
        }
    }
}

/// Runs batches against an interpreter.
pub struct Executor<'a> {
    interpreter: &'a dyn OperationInterpreter,
}

impl<'a> Executor<'a> {
    pub fn new(interpreter: &'a dyn OperationInterpreter) -> Self {
        Self { interpreter }
    }

    /// Execute every operation of a committed batch in order.
    pub fn run_forward(&self, batch: &mut Batch, cancel: &CancelToken) -> Result<(), ExecutorError> {
        if !batch.is_committed() {
            return Err(ExecutorError::NotCommitted {
                stage: batch.stage.clone(),
            });
        }
        if batch.state != BatchState::NotStarted {
            return Err(ExecutorError::AlreadyExecuted {
                stage: batch.stage.clone(),
                state: batch.state,
            });
        }

        let total = batch.len();
        for index in 0..total {
            if cancel.is_cancelled() {
                let unwind_errors = self.unwind(batch, index);
                batch.state = BatchState::Failed;
                return Err(ExecutorError::Cancelled {
                    completed: index,
                    unwind_errors,
                });
            }

            let op = &mut batch.operations_mut()[index];
            match self.interpreter.forward(op) {
                Ok(()) => {
                    op.status = OperationStatus::Done;
                    debug!(artifact = %op.artifact_id, kind = %op.kind, "forward done");
                }
                Err(source) => {
                    op.status = OperationStatus::Failed;
                    let artifact = op.artifact_id.clone();
                    warn!(artifact = %artifact, error = %source, "forward failed; unwinding batch");
                    let unwind_errors = self.unwind(batch, index);
                    batch.state = BatchState::Failed;
                    return Err(ExecutorError::Forward {
                        artifact,
                        source,
                        unwind_errors,
                    });
                }
            }
        }

        batch.state = BatchState::Applied;
        Ok(())
    }

    /// Undo every completed operation of a batch, last first.
    ///
    /// Operations that never completed are skipped. Stops at the first
    /// undo failure; running it again later is safe.
    pub fn run_backward(&self, batch: &mut Batch) -> Result<usize, ExecutorError> {
        let mut undone = 0;
        for op in batch.operations_mut().iter_mut().rev() {
            if op.status != OperationStatus::Done {
                continue;
            }
            self.interpreter
                .undo(&op.undo)
                .map_err(|source| ExecutorError::Undo {
                    artifact: op.artifact_id.clone(),
                    source,
                })?;
            op.status = OperationStatus::Undone;
            undone += 1;
        }
        batch.state = BatchState::RolledBack;
        Ok(undone)
    }

    /// Undo operations `[0, upto)` in reverse; best effort, collects failures.
    fn unwind(&self, batch: &mut Batch, upto: usize) -> Vec<String> {
        let mut errors = Vec::new();
        for op in batch.operations_mut()[..upto].iter_mut().rev() {
            if op.status != OperationStatus::Done {
                continue;
            }
            match self.interpreter.undo(&op.undo) {
                Ok(()) => op.status = OperationStatus::Undone,
                Err(e) => errors.push(format!("{}: {}", op.artifact_id, e)),
            }
        }
        errors
    }
}
