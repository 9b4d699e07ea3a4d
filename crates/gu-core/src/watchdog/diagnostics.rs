//! Crash diagnostics bundle.

use super::MonitorSession;
use crate::journal::Journal;
use crate::recovery::ExitReason;
use crate::store::StateStore;
use gu_bundle::DumpWriter;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Last `limit` bytes of a log file; empty when unreadable.
pub(crate) fn tail(path: &Path, limit: usize) -> Vec<u8> {
    let Ok(mut file) = File::open(path) else {
        return Vec::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    let start = len.saturating_sub(limit as u64);
    if file.seek(SeekFrom::Start(start)).is_err() {
        return Vec::new();
    }
    let mut buf = Vec::with_capacity((len - start) as usize);
    let _ = file.read_to_end(&mut buf);
    buf
}

/// Write `<dump_path>`: session, exit reason, journal, output tails.
pub(crate) fn write_dump(
    store: &StateStore,
    session: &MonitorSession,
    reason: &ExitReason,
    capture_bytes: usize,
) -> gu_bundle::Result<PathBuf> {
    let mut dump = DumpWriter::new(session.target_id.as_str(), crate::logging::get_host_id())
        .updater_version(crate::VERSION)
        .summary(format!("{}: {}", session.target_id, reason));

    dump.session(session)?;
    dump.exit(reason)?;
    match Journal::open(store, &session.target_id) {
        Ok(journal) => {
            if let Some(id) = &journal.snapshot().session_id {
                dump = dump.session_id(id.as_str());
            }
            dump.journal(journal.snapshot())?;
        }
        Err(e) => dump.note("journal.error.txt", e.to_string().into_bytes())?,
    }
    for (stream, path) in [("stdout", &session.stdout_log), ("stderr", &session.stderr_log)] {
        if let Some(path) = path {
            dump.log(stream, tail(path, capture_bytes))?;
        }
    }

    dump.write(&session.dump_path)?;
    Ok(session.dump_path.clone())
}
