//! Fuzz target for updater.json parsing and validation.

#![no_main]

use gu_config::{validate_config, UpdaterConfig};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(config) = UpdaterConfig::from_json(text) {
            let _ = validate_config(&config);
        }
    }
});
