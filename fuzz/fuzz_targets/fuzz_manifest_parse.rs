#![no_main]

use libfuzzer_sys::fuzz_target;
use qg_types::Manifest;

// Manifests are untrusted input: parsing must never panic.
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(manifest) = Manifest::from_json_str(text)
        && let Some(hash) = manifest.normalized_hash()
    {
        assert!(!hash.chars().any(|c| c.is_ascii_uppercase()));
    }
});
