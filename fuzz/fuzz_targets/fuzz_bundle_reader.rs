//! Fuzz target for crash-dump reading.
//!
//! Dumps are collected from user machines, so the reader must reject
//! arbitrary bytes with an error rather than a panic.

#![no_main]

use gu_bundle::DumpReader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(mut reader) = DumpReader::from_bytes(data.to_vec()) {
        let _ = reader.damaged();
    }
});
