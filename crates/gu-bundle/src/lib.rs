//! Crash dumps for General Update.
//!
//! When a relaunched target exits abnormally the watchdog packages what it
//! knows into one ZIP, so the failure can be inspected after the recovery
//! agent has already rolled the install back.
//!
//! A dump holds `manifest.json` first, then typed entries:
//!
//! | entry            | kind      |
//! |------------------|-----------|
//! | `session.json`   | session   |
//! | `exit.json`      | exit      |
//! | `journal.json`   | journal   |
//! | `logs/<s>.log`   | log       |
//! | anything else    | note      |
//!
//! Every entry carries a SHA-256 in the manifest; [`DumpReader`] checks it
//! on each read.
//!
//! ```no_run
//! use gu_bundle::{DumpReader, DumpWriter};
//! use std::path::Path;
//!
//! let mut dump = DumpWriter::new("editor-1a2b3c4d", "host-abc");
//! dump.exit(&serde_json::json!({"kind": "signaled", "signal": 11})).unwrap();
//! dump.write(Path::new("editor_1.5.0_fail.zip")).unwrap();
//!
//! let mut reader = DumpReader::open(Path::new("editor_1.5.0_fail.zip")).unwrap();
//! let exit: serde_json::Value = reader.json("exit.json").unwrap();
//! ```

pub mod error;
pub mod manifest;
pub mod reader;
pub mod writer;

pub use error::{DumpError, Result};
pub use manifest::{DumpEntry, DumpManifest, EntryKind, DUMP_FORMAT, MANIFEST_ENTRY};
pub use reader::DumpReader;
pub use writer::DumpWriter;
