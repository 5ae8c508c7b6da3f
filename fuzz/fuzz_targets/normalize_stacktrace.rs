#![no_main]

use libfuzzer_sys::fuzz_target;

use crucible::dedup::{TOP_FRAMES, crash_token, normalize_stacktrace};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let frames = normalize_stacktrace(text);
    assert!(frames.len() <= TOP_FRAMES);

    // Normalisation is deterministic and token derivation total.
    let again = normalize_stacktrace(text);
    assert_eq!(frames, again);
    let a = crash_token("address", &frames);
    let b = crash_token("address", &frames);
    assert_eq!(a, b);
});
