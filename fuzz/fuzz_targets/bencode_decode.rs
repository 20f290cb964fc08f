#![no_main]

use libfuzzer_sys::fuzz_target;
use slipway_bencode::{decode, decode_lenient, encode};

fuzz_target!(|data: &[u8]| {
    let _ = decode_lenient(data);

    if let Ok(value) = decode(data) {
        // Anything that decodes strictly must re-encode canonically and
        // decode back to the same value.
        let canonical = encode(&value);
        let reparsed = decode(&canonical).expect("canonical encoding must decode");
        assert_eq!(reparsed, value);
    }
});
