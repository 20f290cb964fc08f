#![no_main]

use std::fs;

use libfuzzer_sys::fuzz_target;
use slipway::state::StateStore;
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    let store = match StateStore::open(td.path()) {
        Ok(v) => v,
        Err(_) => return,
    };
    if fs::write(store.state_path(), data).is_ok() {
        let _ = store.snapshot();
    }
});
