#![forbid(unsafe_code)]

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

use qg_types::{
    ArtifactFormat, BYTES_PER_MIB, CheckCategory, FindingKind, GuardResult, GuardStatus, Severity,
    bytes_to_gib, bytes_to_mib,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_MIN_PLAUSIBLE_BYTES: u64 = 100 * BYTES_PER_MIB;
pub const DEFAULT_ENTROPY_WINDOW_BYTES: u64 = 1024;
pub const DEFAULT_ENTROPY_FLOOR: f64 = 0.10;
pub const HEADER_BYTES: usize = 16;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GuardError {
    #[error("entropy floor {0} is outside [0, 1]")]
    EntropyFloorOutOfRange(f64),
    #[error("entropy window must be non-zero")]
    ZeroEntropyWindow,
    #[error("chunk size must be non-zero")]
    ZeroChunkSize,
    #[error("size ceiling must be positive")]
    NonPositiveCeiling,
}

// ── Byte sampling ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ByteHistogram {
    counts: [u64; 256],
    total: u64,
}

impl Default for ByteHistogram {
    fn default() -> Self {
        Self {
            counts: [0; 256],
            total: 0,
        }
    }
}

impl ByteHistogram {
    pub fn observe(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.counts[usize::from(*byte)] += 1;
        }
        self.total += bytes.len() as u64;
    }

    #[must_use]
    pub fn profile(&self) -> ByteProfile {
        let unique_bytes = self.counts.iter().filter(|count| **count > 0).count();
        let entropy_bits = if self.total == 0 {
            0.0
        } else {
            let total = self.total as f64;
            self.counts
                .iter()
                .filter(|count| **count > 0)
                .map(|count| {
                    let p = *count as f64 / total;
                    -p * p.log2()
                })
                .sum()
        };
        ByteProfile {
            sampled_bytes: self.total,
            unique_bytes,
            distinct_ratio: unique_bytes as f64 / 256.0,
            entropy_bits,
        }
    }
}

/// Byte-distribution summary of a leading sample window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ByteProfile {
    pub sampled_bytes: u64,
    pub unique_bytes: usize,
    /// Unique byte values over the 256 possible.
    pub distinct_ratio: f64,
    /// Shannon entropy in bits per byte, in [0, 8].
    pub entropy_bits: f64,
}

/// Reads at most `window` bytes from `reader` in `chunk_size` pieces.
pub fn profile_reader(
    reader: &mut dyn Read,
    window: u64,
    chunk_size: usize,
) -> io::Result<ByteProfile> {
    let mut histogram = ByteHistogram::default();
    let mut limited = reader.take(window);
    let mut buffer = vec![0_u8; chunk_size.max(1)];
    loop {
        let n = match limited.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        histogram.observe(&buffer[..n]);
    }
    Ok(histogram.profile())
}

pub fn profile_leading_window(
    path: &Path,
    window: u64,
    chunk_size: usize,
) -> io::Result<ByteProfile> {
    let mut file = File::open(path)?;
    profile_reader(&mut file, window, chunk_size)
}

// ── Header inspection ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderInfo {
    pub hex: String,
    pub detected_format: ArtifactFormat,
}

impl HeaderInfo {
    #[must_use]
    pub fn inspect(header: &[u8], path: &Path) -> Self {
        let detected_format = if header.starts_with(b"GGUF") {
            ArtifactFormat::Gguf
        } else if header.len() >= 6 && &header[4..6] == b"ET" {
            // ExecuTorch flatbuffer file identifier ("ET12", ...) at offset 4.
            ArtifactFormat::Pte
        } else {
            ArtifactFormat::from_path(path)
        };
        let hex = header.iter().map(|byte| format!("{byte:02x}")).collect();
        Self {
            hex,
            detected_format,
        }
    }
}

// ── Guards ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HardGuard {
    Existence,
    NonEmpty,
    BufferReadable,
    SizeCeiling { max_bytes: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SoftGuard {
    PlausibleSize { min_bytes: u64 },
    EntropySanity { window_bytes: u64, floor: f64 },
}

/// A guard carries its own halt policy: only `Hard` guards stop the chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Guard {
    Hard(HardGuard),
    Soft(SoftGuard),
}

impl Guard {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Hard(HardGuard::Existence) => "existence",
            Self::Hard(HardGuard::NonEmpty) => "non-empty",
            Self::Hard(HardGuard::BufferReadable) => "buffer-readability",
            Self::Hard(HardGuard::SizeCeiling { .. }) => "size-ceiling",
            Self::Soft(SoftGuard::PlausibleSize { .. }) => "plausible-size",
            Self::Soft(SoftGuard::EntropySanity { .. }) => "entropy-sanity",
        }
    }

    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::Hard(_) => Severity::Hard,
            Self::Soft(_) => Severity::Soft,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub min_plausible_bytes: u64,
    pub entropy_window_bytes: u64,
    pub entropy_floor: f64,
    pub max_size_bytes: Option<u64>,
    pub chunk_size: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            min_plausible_bytes: DEFAULT_MIN_PLAUSIBLE_BYTES,
            entropy_window_bytes: DEFAULT_ENTROPY_WINDOW_BYTES,
            entropy_floor: DEFAULT_ENTROPY_FLOOR,
            max_size_bytes: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl GuardConfig {
    pub fn validate(&self) -> Result<(), GuardError> {
        if !(0.0..=1.0).contains(&self.entropy_floor) {
            return Err(GuardError::EntropyFloorOutOfRange(self.entropy_floor));
        }
        if self.entropy_window_bytes == 0 {
            return Err(GuardError::ZeroEntropyWindow);
        }
        if self.chunk_size == 0 {
            return Err(GuardError::ZeroChunkSize);
        }
        if self.max_size_bytes == Some(0) {
            return Err(GuardError::NonPositiveCeiling);
        }
        Ok(())
    }
}

/// Facts established while the chain ran, reused by later pipeline stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactFacts {
    pub size_bytes: Option<u64>,
    pub header: Option<HeaderInfo>,
    pub entropy: Option<ByteProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardChainOutcome {
    pub results: Vec<GuardResult>,
    pub halted: bool,
    pub facts: ArtifactFacts,
}

impl GuardChainOutcome {
    #[must_use]
    pub fn first_failure(&self) -> Option<&GuardResult> {
        self.results
            .iter()
            .find(|result| matches!(result.status, GuardStatus::Fail))
    }
}

#[derive(Debug, Clone)]
pub struct GuardChain {
    guards: Vec<Guard>,
    chunk_size: usize,
}

impl GuardChain {
    pub fn from_config(config: &GuardConfig) -> Result<Self, GuardError> {
        config.validate()?;
        let mut guards = vec![
            Guard::Hard(HardGuard::Existence),
            Guard::Hard(HardGuard::NonEmpty),
            Guard::Hard(HardGuard::BufferReadable),
            Guard::Soft(SoftGuard::PlausibleSize {
                min_bytes: config.min_plausible_bytes,
            }),
            Guard::Soft(SoftGuard::EntropySanity {
                window_bytes: config.entropy_window_bytes,
                floor: config.entropy_floor,
            }),
        ];
        if let Some(max_bytes) = config.max_size_bytes {
            guards.push(Guard::Hard(HardGuard::SizeCeiling { max_bytes }));
        }
        Ok(Self {
            guards,
            chunk_size: config.chunk_size,
        })
    }

    pub fn new(guards: Vec<Guard>, chunk_size: usize) -> Result<Self, GuardError> {
        if chunk_size == 0 {
            return Err(GuardError::ZeroChunkSize);
        }
        Ok(Self { guards, chunk_size })
    }

    /// Existence and non-empty checks plus the size ceiling, if configured.
    /// Used when only integrity is being verified.
    pub fn existence_and_ceiling(config: &GuardConfig) -> Result<Self, GuardError> {
        config.validate()?;
        let mut guards = vec![
            Guard::Hard(HardGuard::Existence),
            Guard::Hard(HardGuard::NonEmpty),
        ];
        if let Some(max_bytes) = config.max_size_bytes {
            guards.push(Guard::Hard(HardGuard::SizeCeiling { max_bytes }));
        }
        Self::new(guards, config.chunk_size)
    }

    #[must_use]
    pub fn guards(&self) -> &[Guard] {
        &self.guards
    }

    /// Runs every guard in order until a hard guard fails.
    #[must_use]
    pub fn run(&self, path: &Path) -> GuardChainOutcome {
        let mut facts = ArtifactFacts::default();
        let mut results = Vec::with_capacity(self.guards.len());
        let mut halted = false;

        for guard in &self.guards {
            let result = self.evaluate(guard, path, &mut facts);
            #[cfg(feature = "tracing")]
            tracing::debug!(guard = guard.name(), status = ?result.status, "guard evaluated");
            let halts = result.halts();
            results.push(result);
            if halts {
                halted = true;
                break;
            }
        }

        GuardChainOutcome {
            results,
            halted,
            facts,
        }
    }

    fn evaluate(&self, guard: &Guard, path: &Path, facts: &mut ArtifactFacts) -> GuardResult {
        let name = guard.name();
        match *guard {
            Guard::Hard(HardGuard::Existence) => check_existence(name, path, facts),
            Guard::Hard(HardGuard::NonEmpty) => check_non_empty(name, facts),
            Guard::Hard(HardGuard::BufferReadable) => {
                check_buffer_readable(name, path, self.chunk_size, facts)
            }
            Guard::Hard(HardGuard::SizeCeiling { max_bytes }) => {
                check_size_ceiling(name, max_bytes, facts)
            }
            Guard::Soft(SoftGuard::PlausibleSize { min_bytes }) => {
                check_plausible_size(name, min_bytes, facts)
            }
            Guard::Soft(SoftGuard::EntropySanity {
                window_bytes,
                floor,
            }) => check_entropy(name, path, window_bytes, floor, self.chunk_size, facts),
        }
    }
}

fn hard_fail(name: &str, kind: FindingKind, detail: impl Into<String>) -> GuardResult {
    GuardResult::finding(
        name,
        CheckCategory::Structural,
        Severity::Hard,
        GuardStatus::Fail,
        kind,
        detail,
    )
}

fn soft_warn(name: &str, kind: FindingKind, detail: impl Into<String>) -> GuardResult {
    GuardResult::finding(
        name,
        CheckCategory::Structural,
        Severity::Soft,
        GuardStatus::Warn,
        kind,
        detail,
    )
}

fn pass(name: &str, severity: Severity, detail: impl Into<String>) -> GuardResult {
    GuardResult::pass(name, CheckCategory::Structural, severity, detail)
}

fn check_existence(name: &str, path: &Path, facts: &mut ArtifactFacts) -> GuardResult {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) => {
            return hard_fail(
                name,
                FindingKind::FileNotFound,
                format!("{}: {err}", path.display()),
            );
        }
    };
    if !meta.is_file() {
        return hard_fail(
            name,
            FindingKind::FileNotFound,
            format!("{} is not a regular file", path.display()),
        );
    }
    if let Err(err) = File::open(path) {
        return hard_fail(
            name,
            FindingKind::FileNotFound,
            format!("{} is not readable: {err}", path.display()),
        );
    }
    facts.size_bytes = Some(meta.len());
    pass(name, Severity::Hard, format!("{} exists", path.display()))
}

fn check_non_empty(name: &str, facts: &ArtifactFacts) -> GuardResult {
    match facts.size_bytes {
        Some(0) | None => hard_fail(name, FindingKind::EmptyArtifact, "artifact is 0 bytes")
            .with_values("0 bytes", "> 0 bytes"),
        Some(size) => pass(
            name,
            Severity::Hard,
            format!(
                "{size} bytes ({:.2} MB, {:.3} GB)",
                bytes_to_mib(size),
                bytes_to_gib(size)
            ),
        ),
    }
}

fn check_buffer_readable(
    name: &str,
    path: &Path,
    chunk_size: usize,
    facts: &mut ArtifactFacts,
) -> GuardResult {
    let expected = facts.size_bytes.unwrap_or_default();
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            return hard_fail(name, FindingKind::BufferReadError, format!("open failed: {err}"));
        }
    };

    let mut buffer = vec![0_u8; chunk_size.max(HEADER_BYTES)];
    let mut header = Vec::with_capacity(HEADER_BYTES);
    let mut total = 0_u64;
    loop {
        let n = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                return hard_fail(
                    name,
                    FindingKind::BufferReadError,
                    format!("read failed after {total} bytes: {err}"),
                );
            }
        };
        if header.len() < HEADER_BYTES {
            let take = (HEADER_BYTES - header.len()).min(n);
            header.extend_from_slice(&buffer[..take]);
        }
        total += n as u64;
    }

    facts.header = Some(HeaderInfo::inspect(&header, path));
    if total != expected {
        return hard_fail(
            name,
            FindingKind::BufferReadError,
            "byte stream length differs from reported file size",
        )
        .with_values(format!("{total} bytes read"), format!("{expected} bytes"));
    }
    pass(name, Severity::Hard, format!("{total} bytes readable"))
}

fn check_plausible_size(name: &str, min_bytes: u64, facts: &ArtifactFacts) -> GuardResult {
    let size = facts.size_bytes.unwrap_or_default();
    if size < min_bytes {
        return soft_warn(
            name,
            FindingKind::ImplausiblySmall,
            "artifact is smaller than the smallest expected quantized model",
        )
        .with_values(
            format!("{:.2} MB", bytes_to_mib(size)),
            format!(">= {:.2} MB", bytes_to_mib(min_bytes)),
        );
    }
    pass(
        name,
        Severity::Soft,
        format!(
            "{:.2} MB >= {:.2} MB",
            bytes_to_mib(size),
            bytes_to_mib(min_bytes)
        ),
    )
}

fn check_entropy(
    name: &str,
    path: &Path,
    window_bytes: u64,
    floor: f64,
    chunk_size: usize,
    facts: &mut ArtifactFacts,
) -> GuardResult {
    let profile = match profile_leading_window(path, window_bytes, chunk_size) {
        Ok(profile) => profile,
        Err(err) => {
            return soft_warn(
                name,
                FindingKind::LowEntropy,
                format!("sample window unreadable: {err}"),
            );
        }
    };
    let ratio = profile.distinct_ratio;
    let detail = format!(
        "first {} bytes: {}/256 unique, {:.2} bits/byte",
        profile.sampled_bytes, profile.unique_bytes, profile.entropy_bits
    );
    facts.entropy = Some(profile);
    if ratio < floor {
        return soft_warn(
            name,
            FindingKind::LowEntropy,
            format!("{detail}; likely padding or zero-fill"),
        )
        .with_values(format!("{:.2}%", ratio * 100.0), format!(">= {:.2}%", floor * 100.0));
    }
    pass(name, Severity::Soft, detail)
}

fn check_size_ceiling(name: &str, max_bytes: u64, facts: &ArtifactFacts) -> GuardResult {
    let size = facts.size_bytes.unwrap_or_default();
    if size > max_bytes {
        return hard_fail(
            name,
            FindingKind::SizeCeilingExceeded,
            "artifact exceeds the configured size ceiling",
        )
        .with_values(
            format!("{:.3} GB", bytes_to_gib(size)),
            format!("<= {:.3} GB", bytes_to_gib(max_bytes)),
        );
    }
    pass(
        name,
        Severity::Hard,
        format!(
            "{:.3} GB within {:.3} GB limit",
            bytes_to_gib(size),
            bytes_to_gib(max_bytes)
        ),
    )
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Cursor;

    use proptest::prelude::*;
    use qg_types::{ArtifactFormat, FindingKind, GuardStatus, Severity};
    use tempfile::tempdir;

    use super::{
        ByteHistogram, Guard, GuardChain, GuardConfig, HardGuard, HeaderInfo, profile_reader,
    };

    fn permissive_config() -> GuardConfig {
        GuardConfig {
            min_plausible_bytes: 1,
            ..GuardConfig::default()
        }
    }

    fn diverse_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn default_chain_orders_hard_guards_first() {
        let chain = GuardChain::from_config(&GuardConfig::default()).expect("chain");
        let names: Vec<&str> = chain.guards().iter().map(Guard::name).collect();
        assert_eq!(
            names,
            vec![
                "existence",
                "non-empty",
                "buffer-readability",
                "plausible-size",
                "entropy-sanity"
            ]
        );
    }

    #[test]
    fn missing_file_halts_immediately() {
        let dir = tempdir().expect("tempdir");
        let chain = GuardChain::from_config(&GuardConfig::default()).expect("chain");
        let outcome = chain.run(&dir.path().join("missing.pte"));
        assert!(outcome.halted);
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].kind, Some(FindingKind::FileNotFound));
    }

    #[test]
    fn directory_is_not_an_artifact() {
        let dir = tempdir().expect("tempdir");
        let chain = GuardChain::from_config(&GuardConfig::default()).expect("chain");
        let outcome = chain.run(dir.path());
        assert_eq!(outcome.results[0].kind, Some(FindingKind::FileNotFound));
    }

    #[test]
    fn empty_file_halts_at_non_empty_guard() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("empty.pte");
        fs::write(&path, b"").expect("write");
        let chain = GuardChain::from_config(&GuardConfig::default()).expect("chain");
        let outcome = chain.run(&path);
        assert!(outcome.halted);
        assert_eq!(outcome.results.len(), 2);
        let failure = outcome.first_failure().expect("failure");
        assert_eq!(failure.kind, Some(FindingKind::EmptyArtifact));
        assert_eq!(failure.observed.as_deref(), Some("0 bytes"));
    }

    #[test]
    fn small_diverse_file_passes_hard_guards_and_warns_on_size() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("model.pte");
        fs::write(&path, diverse_bytes(4096)).expect("write");
        let chain = GuardChain::from_config(&GuardConfig::default()).expect("chain");
        let outcome = chain.run(&path);

        assert!(!outcome.halted);
        assert_eq!(outcome.results.len(), 5);
        assert!(outcome.first_failure().is_none());
        let size = &outcome.results[3];
        assert_eq!(size.status, GuardStatus::Warn);
        assert_eq!(size.kind, Some(FindingKind::ImplausiblySmall));
        assert_eq!(size.severity, Severity::Soft);
        assert_eq!(outcome.results[4].status, GuardStatus::Pass);
        assert_eq!(outcome.facts.size_bytes, Some(4096));
    }

    #[test]
    fn zero_fill_is_flagged_low_entropy_without_halting() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("padding.pte");
        fs::write(&path, vec![0_u8; 8192]).expect("write");
        let chain = GuardChain::from_config(&permissive_config()).expect("chain");
        let outcome = chain.run(&path);

        assert!(!outcome.halted);
        let entropy = outcome.results.last().expect("entropy");
        assert_eq!(entropy.kind, Some(FindingKind::LowEntropy));
        assert_eq!(entropy.status, GuardStatus::Warn);
        let profile = outcome.facts.entropy.expect("profile");
        assert_eq!(profile.unique_bytes, 1);
        assert_eq!(profile.sampled_bytes, 1024);
    }

    #[test]
    fn size_ceiling_is_a_hard_failure() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("model.pte");
        fs::write(&path, diverse_bytes(2048)).expect("write");
        let config = GuardConfig {
            max_size_bytes: Some(1024),
            ..permissive_config()
        };
        let chain = GuardChain::from_config(&config).expect("chain");
        assert!(matches!(
            chain.guards().last(),
            Some(Guard::Hard(HardGuard::SizeCeiling { max_bytes: 1024 }))
        ));
        let outcome = chain.run(&path);
        assert!(outcome.halted);
        assert_eq!(
            outcome.first_failure().and_then(|r| r.kind),
            Some(FindingKind::SizeCeilingExceeded)
        );
    }

    #[test]
    fn verify_scope_skips_content_guards() {
        let config = GuardConfig {
            max_size_bytes: Some(1 << 30),
            ..GuardConfig::default()
        };
        let chain = GuardChain::existence_and_ceiling(&config).expect("chain");
        let names: Vec<&str> = chain.guards().iter().map(Guard::name).collect();
        assert_eq!(names, vec!["existence", "non-empty", "size-ceiling"]);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = GuardConfig {
            entropy_floor: 1.5,
            ..GuardConfig::default()
        };
        assert!(GuardChain::from_config(&config).is_err());
    }

    #[test]
    fn header_magic_detects_container_format() {
        let gguf = HeaderInfo::inspect(b"GGUF\x03\x00\x00\x00", std::path::Path::new("x.bin"));
        assert_eq!(gguf.detected_format, ArtifactFormat::Gguf);
        assert_eq!(gguf.hex, "4747554603000000");

        let pte = HeaderInfo::inspect(b"\x1c\x00\x00\x00ET12", std::path::Path::new("x.bin"));
        assert_eq!(pte.detected_format, ArtifactFormat::Pte);

        let onnx = HeaderInfo::inspect(b"\x08\x07", std::path::Path::new("m.onnx"));
        assert_eq!(onnx.detected_format, ArtifactFormat::Onnx);
    }

    #[test]
    fn uniform_distribution_has_eight_bits() {
        let mut histogram = ByteHistogram::default();
        let bytes: Vec<u8> = (0..=255).collect();
        histogram.observe(&bytes);
        let profile = histogram.profile();
        assert_eq!(profile.unique_bytes, 256);
        assert!((profile.entropy_bits - 8.0).abs() < 1e-9);
        assert!((profile.distinct_ratio - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn chain_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("model.pte");
        fs::write(&path, diverse_bytes(3000)).expect("write");
        let chain = GuardChain::from_config(&GuardConfig::default()).expect("chain");
        assert_eq!(chain.run(&path), chain.run(&path));
    }

    proptest! {
        #[test]
        fn sampling_never_exceeds_window(
            bytes in proptest::collection::vec(any::<u8>(), 0..8192),
            window in 1_u64..4096,
            chunk in 1_usize..700,
        ) {
            let profile = profile_reader(&mut Cursor::new(bytes.clone()), window, chunk).expect("profile");
            prop_assert_eq!(profile.sampled_bytes, window.min(bytes.len() as u64));
            prop_assert!(profile.entropy_bits >= 0.0 && profile.entropy_bits <= 8.0 + 1e-9);
            prop_assert!(profile.distinct_ratio <= 1.0);
        }
    }
}
