#![no_main]

use libfuzzer_sys::fuzz_target;

use crucible::CrucibleConfig;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    // Config parsing must reject garbage without panicking.
    let _ = toml::from_str::<CrucibleConfig>(text);
});
