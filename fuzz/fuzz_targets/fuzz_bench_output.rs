#![no_main]

use libfuzzer_sys::fuzz_target;
use qg_kpi::parse_bench_output;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    if let Ok(report) = parse_bench_output(&text)
        && let Some(rate) = report.tokens_per_second()
    {
        assert!(report.elapsed_ms > 0.0);
        assert!(rate >= 0.0);
    }
});
