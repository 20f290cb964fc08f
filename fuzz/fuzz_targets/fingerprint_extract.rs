#![no_main]

use libfuzzer_sys::fuzz_target;
use slipway::fingerprint::extract_fingerprint;

fuzz_target!(|data: &[u8]| {
    if let Ok(fingerprint) = extract_fingerprint(data) {
        // Same bytes, same fingerprint.
        assert_eq!(extract_fingerprint(data).ok().as_deref(), Some(fingerprint.as_str()));
    }
});
