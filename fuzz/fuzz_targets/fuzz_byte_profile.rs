#![no_main]

use std::io::Cursor;

use libfuzzer_sys::fuzz_target;
use qg_guards::{HeaderInfo, profile_reader};

fuzz_target!(|data: &[u8]| {
    let window = data.first().map_or(1, |b| u64::from(*b) * 8 + 1);
    let chunk = data.get(1).map_or(1, |b| usize::from(*b) + 1);
    let profile = profile_reader(&mut Cursor::new(data), window, chunk)
        .expect("in-memory reads cannot fail");
    assert!(profile.sampled_bytes <= window);
    assert!(profile.unique_bytes <= 256);
    assert!((0.0..=8.0 + 1e-9).contains(&profile.entropy_bits));

    let header = HeaderInfo::inspect(&data[..data.len().min(16)], std::path::Path::new("x"));
    assert_eq!(header.hex.len(), data.len().min(16) * 2);
});
