//! Test helpers shared by unit tests.

use crate::cancel::CancelToken;
use crate::executor::{InterpretError, OperationInterpreter};
use crate::operation::{ForwardPayload, Operation, OperationKind, UndoPayload};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

/// Operation whose forward and undo both name `name`.
pub fn file_op(name: &str) -> Operation {
    Operation::new(
        OperationKind::Apply,
        name,
        ForwardPayload::RemoveFile { path: name.into() },
        UndoPayload::RemoveFile { path: name.into() },
    )
}

fn undo_label(undo: &UndoPayload) -> String {
    let path = |p: &Path| p.to_string_lossy().into_owned();
    match undo {
        UndoPayload::RestoreFile { target, .. } => path(target),
        UndoPayload::RemoveFile { path: p } => path(p),
        UndoPayload::DeregisterArtifact { name, .. } => name.clone(),
        UndoPayload::Noop => "noop".to_string(),
    }
}

/// Interpreter that records calls as `fwd:<artifact>` / `undo:<artifact>`.
#[derive(Default)]
pub struct RecordingInterpreter {
    calls: Mutex<Vec<String>>,
    fail_forward: HashSet<String>,
    fail_undo: HashSet<String>,
    cancel_hook: Mutex<Option<(String, CancelToken)>>,
}

impl RecordingInterpreter {
    pub fn fail_forward(mut self, artifact: &str) -> Self {
        self.fail_forward.insert(artifact.to_string());
        self
    }

    pub fn fail_undo(mut self, artifact: &str) -> Self {
        self.fail_undo.insert(artifact.to_string());
        self
    }

    /// Cancel `token` right after the forward step of `artifact` completes.
    pub fn cancel_after_forward(&self, artifact: &str, token: CancelToken) {
        if let Ok(mut hook) = self.cancel_hook.lock() {
            *hook = Some((artifact.to_string(), token));
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl OperationInterpreter for RecordingInterpreter {
    fn forward(&self, op: &Operation) -> Result<(), InterpretError> {
        self.record(format!("fwd:{}", op.artifact_id));
        if self.fail_forward.contains(&op.artifact_id) {
            return Err(InterpretError::Other(format!("injected failure for {}", op.artifact_id)));
        }
        if let Ok(hook) = self.cancel_hook.lock() {
            if let Some((artifact, token)) = hook.as_ref() {
                if artifact == &op.artifact_id {
                    token.cancel();
                }
            }
        }
        Ok(())
    }

    fn undo(&self, undo: &UndoPayload) -> Result<(), InterpretError> {
        let label = undo_label(undo);
        self.record(format!("undo:{}", label));
        if self.fail_undo.contains(&label) {
            return Err(InterpretError::Other(format!("injected undo failure for {}", label)));
        }
        Ok(())
    }
}
