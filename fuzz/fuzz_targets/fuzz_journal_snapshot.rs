//! Fuzz target for journal snapshots.
//!
//! Snapshots arrive from disk after a crash and from POST /restore bodies.
//! Anything that parses and validates must also rebuild into batches.

#![no_main]

use gu_core::journal::JournalSnapshot;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(snapshot) = serde_json::from_slice::<JournalSnapshot>(data) else {
        return;
    };
    if snapshot.validate().is_err() {
        return;
    }
    for entry in snapshot.batches.iter().rev() {
        let batch = entry.to_batch();
        assert!(batch.is_committed());
        assert_eq!(batch.len(), entry.operations.len());
    }
});
