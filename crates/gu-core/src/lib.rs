//! General Update core library.
//!
//! Crash-resilient update/rollback subsystem:
//! - [`journal`]: durable LIFO journal of committed operation batches
//! - [`operation`] / [`executor`]: reversible operations and their forward/backward runner
//! - [`platform`]: per-OS strategies for fetch, verify, backup, apply, launch
//! - [`pipeline`]: `Fetch → Verify → Backup → Apply → Launch` with in-process rollback
//! - [`watchdog`]: supervises the relaunched target and raises the failure flag
//! - [`recovery`]: failure flag, failure record, and the independent recovery agent
//! - [`server`]: restore-over-snapshot HTTP endpoint

pub mod archive;
pub mod cancel;
pub mod digest;
pub mod events;
pub mod executor;
pub mod exit_codes;
pub mod journal;
pub mod lock;
pub mod logging;
pub mod operation;
pub mod pipeline;
pub mod platform;
pub mod recovery;
#[cfg(feature = "server")]
pub mod server;
pub mod signals;
pub mod source;
pub mod store;
pub mod watchdog;

#[cfg(test)]
pub mod test_utils;

pub use cancel::CancelToken;
pub use executor::{Executor, ExecutorError, OperationInterpreter};
pub use journal::{Journal, JournalEntry, JournalError, JournalSnapshot};
pub use operation::{Batch, BatchState, CommitState, Operation, OperationKind, OperationStatus};
pub use pipeline::{AbortReason, SessionOutcome, SessionReport, UpdateEngine};
pub use recovery::{FailureFlag, FailureRecord, FlagState, RecoveryAgent};
pub use store::StateStore;
pub use watchdog::{MonitorSession, Watchdog};

/// Version of this crate, stamped into diagnostics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
