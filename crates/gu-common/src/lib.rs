//! General Update common types, IDs, and errors.
//!
//! This crate provides foundational types shared across the updater crates:
//! - Target, session, and batch identifiers
//! - The failure taxonomy used to classify every update/restore error
//! - The unified CLI-facing error type with stable codes
//! - Output format specifications

pub mod error;
pub mod id;
pub mod output;

pub use error::{Error, ErrorCategory, FailureClass, Result, StructuredError, SuggestedAction};
pub use id::{BatchId, SessionId, TargetId};
pub use output::OutputFormat;

/// Schema version stamped into every persisted state document.
pub const STATE_SCHEMA_VERSION: &str = "1.0.0";
