//! Durable tri-state failure flag.
//!
//! Every transition is a test-and-set under the target's `flag.lock`:
//!
//! ```text
//! Clear ──raise──▶ Raised ──begin_restore──▶ InRestore ──clear──▶ Clear
//!                                  ▲              │
//!                                  └─restore_failed (stays InRestore, attempts kept)
//! ```

use super::record::FailureRecord;
use super::RecoveryError;
use crate::store::{LockKind, StateStore};
use chrono::{DateTime, Utc};
use gu_common::TargetId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FlagState {
    Clear,
    Raised {
        raised_at: DateTime<Utc>,
        reason: String,
    },
    InRestore {
        raised_at: DateTime<Utc>,
        reason: String,
        started_at: DateTime<Utc>,
        attempts: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_error: Option<String>,
    },
}

impl FlagState {
    pub fn name(&self) -> &'static str {
        match self {
            FlagState::Clear => "clear",
            FlagState::Raised { .. } => "raised",
            FlagState::InRestore { .. } => "in_restore",
        }
    }

    pub fn is_clear(&self) -> bool {
        matches!(self, FlagState::Clear)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FlagDocument {
    target_id: TargetId,
    #[serde(flatten)]
    state: FlagState,
    updated_at: DateTime<Utc>,
}

/// Handle on one target's failure flag.
#[derive(Debug, Clone)]
pub struct FailureFlag {
    store: StateStore,
    target: TargetId,
}

impl FailureFlag {
    pub fn new(store: &StateStore, target: &TargetId) -> Self {
        Self {
            store: store.clone(),
            target: target.clone(),
        }
    }

    /// Current state; a missing flag file reads as `Clear`.
    pub fn load(&self) -> Result<FlagState, RecoveryError> {
        let doc: Option<FlagDocument> = self.store.read_json(&self.store.flag_path(&self.target))?;
        Ok(doc.map(|d| d.state).unwrap_or(FlagState::Clear))
    }

    /// The failure record, if one was written.
    pub fn record(&self) -> Result<Option<FailureRecord>, RecoveryError> {
        Ok(self.store.read_json(&self.store.failure_path(&self.target))?)
    }

    /// `Clear → Raised`, writing `record` first unless one already exists.
    ///
    /// Returns `false` when the flag was already raised or in restore; the
    /// existing record is kept.
    pub fn raise(&self, record: &FailureRecord) -> Result<bool, RecoveryError> {
        self.transition(|state| match state {
            FlagState::Clear => Ok(Some(FlagState::Raised {
                raised_at: Utc::now(),
                reason: record.exit_reason.to_string(),
            })),
            _ => Ok(None),
        }, Some(record))
        .map(|changed| changed.is_some())
    }

    /// `Raised → InRestore`, or resume an abandoned `InRestore`.
    ///
    /// Returns the new state, or `None` when there is nothing to restore.
    /// Callers hold the target's restore lock, so an `InRestore` seen here
    /// has no live owner.
    pub fn begin_restore(&self) -> Result<Option<FlagState>, RecoveryError> {
        self.transition(|state| match state {
            FlagState::Clear => Ok(None),
            FlagState::Raised { raised_at, reason } => Ok(Some(FlagState::InRestore {
                raised_at,
                reason,
                started_at: Utc::now(),
                attempts: 1,
                last_error: None,
            })),
            FlagState::InRestore {
                raised_at,
                reason,
                attempts,
                last_error,
                ..
            } => Ok(Some(FlagState::InRestore {
                raised_at,
                reason,
                started_at: Utc::now(),
                attempts: attempts + 1,
                last_error,
            })),
        }, None)
    }

    /// Record a failed restore attempt; the flag stays `InRestore`.
    pub fn restore_failed(&self, error: &str) -> Result<(), RecoveryError> {
        self.transition(|state| match state {
            FlagState::InRestore {
                raised_at,
                reason,
                started_at,
                attempts,
                ..
            } => Ok(Some(FlagState::InRestore {
                raised_at,
                reason,
                started_at,
                attempts,
                last_error: Some(error.to_string()),
            })),
            _ => Ok(None),
        }, None)
        .map(|_| ())
    }

    /// Delete the failure record, then set `Clear`.
    pub fn clear(&self) -> Result<(), RecoveryError> {
        let _guard = self.store.lock(&self.target, LockKind::Flag)?;
        self.store.remove(&self.store.failure_path(&self.target))?;
        self.write(FlagState::Clear)
    }

    fn transition(
        &self,
        step: impl FnOnce(FlagState) -> Result<Option<FlagState>, RecoveryError>,
        record: Option<&FailureRecord>,
    ) -> Result<Option<FlagState>, RecoveryError> {
        let _guard = self.store.lock(&self.target, LockKind::Flag)?;
        let current = self.load()?;
        let Some(next) = step(current)? else {
            return Ok(None);
        };
        if let Some(record) = record {
            let path = self.store.failure_path(&self.target);
            if !path.exists() {
                self.store.write_json_atomic(&path, record)?;
            }
        }
        self.write(next.clone())?;
        Ok(Some(next))
    }

    fn write(&self, state: FlagState) -> Result<(), RecoveryError> {
        let doc = FlagDocument {
            target_id: self.target.clone(),
            state,
            updated_at: Utc::now(),
        };
        self.store
            .write_json_atomic(&self.store.flag_path(&self.target), &doc)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalSnapshot;
    use crate::recovery::record::ExitReason;
    use tempfile::TempDir;

    fn setup() -> (TempDir, FailureFlag, FailureRecord) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let target = TargetId::from_name("editor");
        let record = FailureRecord::new(
            target.clone(),
            ExitReason::Signaled { signal: 11 },
            &JournalSnapshot::empty(target.clone()),
        );
        (dir, FailureFlag::new(&store, &target), record)
    }

    #[test]
    fn test_missing_flag_is_clear() {
        let (_dir, flag, _) = setup();
        assert_eq!(flag.load().unwrap(), FlagState::Clear);
        assert_eq!(flag.begin_restore().unwrap(), None);
    }

    #[test]
    fn test_full_cycle() {
        let (_dir, flag, record) = setup();
        assert!(flag.raise(&record).unwrap());
        assert_eq!(flag.load().unwrap().name(), "raised");
        assert!(flag.record().unwrap().is_some());

        let state = flag.begin_restore().unwrap().unwrap();
        assert!(matches!(state, FlagState::InRestore { attempts: 1, .. }));

        flag.clear().unwrap();
        assert!(flag.load().unwrap().is_clear());
        assert!(flag.record().unwrap().is_none());
    }

    #[test]
    fn test_raise_is_once() {
        let (_dir, flag, record) = setup();
        assert!(flag.raise(&record).unwrap());
        let mut second = record.clone();
        second.exit_reason = ExitReason::UnexpectedCode { code: 3 };
        assert!(!flag.raise(&second).unwrap());
        assert_eq!(flag.record().unwrap().unwrap().exit_reason, record.exit_reason);
    }

    #[test]
    fn test_failed_restore_is_resumable() {
        let (_dir, flag, record) = setup();
        flag.raise(&record).unwrap();
        flag.begin_restore().unwrap();
        flag.restore_failed("undo of a.txt failed").unwrap();

        match flag.load().unwrap() {
            FlagState::InRestore { attempts, last_error, .. } => {
                assert_eq!(attempts, 1);
                assert_eq!(last_error.as_deref(), Some("undo of a.txt failed"));
            }
            other => panic!("unexpected state {other:?}"),
        }
        // Raising again does not reset a pending restore.
        assert!(!flag.raise(&record).unwrap());

        match flag.begin_restore().unwrap() {
            Some(FlagState::InRestore { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("unexpected state {other:?}"),
        }
    }
}
