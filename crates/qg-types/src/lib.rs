#![forbid(unsafe_code)]

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const BYTES_PER_MIB: u64 = 1024 * 1024;
pub const BYTES_PER_GIB: u64 = 1024 * 1024 * 1024;

#[must_use]
pub fn bytes_to_mib(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MIB as f64
}

#[must_use]
pub fn bytes_to_gib(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GIB as f64
}

#[derive(Debug, Error)]
pub enum TypeError {
    #[error("ratio {0} is outside [0, 1]")]
    RatioOutOfRange(f64),
    #[error("manifest is not valid JSON: {0}")]
    ManifestFormat(#[from] serde_json::Error),
}

// ── Status lattice ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GuardStatus {
    Pass,
    Fail,
    Warn,
}

impl GuardStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Warn => "WARN",
        }
    }
}

impl fmt::Display for GuardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GateStatus {
    Pass,
    Fail,
    Unknown,
}

impl GateStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Exit code used by single-purpose tools that report one gate.
    #[must_use]
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Pass => 0,
            Self::Fail => 1,
            Self::Unknown => 2,
        }
    }
}

impl fmt::Display for GateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OverallStatus {
    Pass,
    Fail,
    Incomplete,
}

impl OverallStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Incomplete => "INCOMPLETE",
        }
    }

    #[must_use]
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Pass => 0,
            Self::Fail => 1,
            Self::Incomplete => 2,
        }
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Halt policy of a check. A failing `Hard` check stops everything after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Hard,
    Soft,
}

impl Severity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hard => "hard",
            Self::Soft => "soft",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckCategory {
    Integrity,
    Structural,
    Coverage,
    Kpi,
    DeviceFit,
}

impl CheckCategory {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Integrity => "integrity",
            Self::Structural => "structural",
            Self::Coverage => "coverage",
            Self::Kpi => "kpi",
            Self::DeviceFit => "device-fit",
        }
    }
}

impl fmt::Display for CheckCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FindingKind {
    FileNotFound,
    EmptyArtifact,
    BufferReadError,
    HashMismatch,
    SizeMismatch,
    SizeCeilingExceeded,
    IntegrityUnverifiable,
    NoManifest,
    ManifestTargetMismatch,
    ImplausiblySmall,
    LowEntropy,
    CoverageBelowTarget,
    CoverageUnavailable,
    DeviceBudgetExceeded,
}

impl FindingKind {
    /// Short tag printed next to `WARN`/`FAIL` in the human report.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::FileNotFound => "FileNotFound",
            Self::EmptyArtifact => "EmptyArtifact",
            Self::BufferReadError => "BufferReadError",
            Self::HashMismatch => "HashMismatch",
            Self::SizeMismatch => "SizeMismatch",
            Self::SizeCeilingExceeded => "SizeCeilingExceeded",
            Self::IntegrityUnverifiable => "integrity-unverifiable",
            Self::NoManifest => "no-manifest",
            Self::ManifestTargetMismatch => "manifest-target-mismatch",
            Self::ImplausiblySmall => "implausibly-small",
            Self::LowEntropy => "low-entropy",
            Self::CoverageBelowTarget => "coverage-below-target",
            Self::CoverageUnavailable => "coverage-unavailable",
            Self::DeviceBudgetExceeded => "device-budget-exceeded",
        }
    }
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

// ── Guard results ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardResult {
    pub name: String,
    pub category: CheckCategory,
    pub severity: Severity,
    pub status: GuardStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FindingKind>,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
}

impl GuardResult {
    #[must_use]
    pub fn pass(
        name: impl Into<String>,
        category: CheckCategory,
        severity: Severity,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            category,
            severity,
            status: GuardStatus::Pass,
            kind: None,
            detail: detail.into(),
            observed: None,
            expected: None,
        }
    }

    #[must_use]
    pub fn finding(
        name: impl Into<String>,
        category: CheckCategory,
        severity: Severity,
        status: GuardStatus,
        kind: FindingKind,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            category,
            severity,
            status,
            kind: Some(kind),
            detail: detail.into(),
            observed: None,
            expected: None,
        }
    }

    #[must_use]
    pub fn with_values(mut self, observed: impl Into<String>, expected: impl Into<String>) -> Self {
        self.observed = Some(observed.into());
        self.expected = Some(expected.into());
        self
    }

    #[must_use]
    pub fn is_hard(&self) -> bool {
        matches!(self.severity, Severity::Hard)
    }

    /// True when this result must stop every later stage.
    #[must_use]
    pub fn halts(&self) -> bool {
        self.is_hard() && matches!(self.status, GuardStatus::Fail)
    }
}

// ── Coverage ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageEstimate {
    pub ratio: f64,
    pub confidence: Confidence,
    pub method: String,
}

impl CoverageEstimate {
    pub fn new(
        ratio: f64,
        confidence: Confidence,
        method: impl Into<String>,
    ) -> Result<Self, TypeError> {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(TypeError::RatioOutOfRange(ratio));
        }
        Ok(Self {
            ratio,
            confidence,
            method: method.into(),
        })
    }
}

// ── KPI samples ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KpiMetric {
    TtftMs,
    TokS,
    MemPeakMb,
}

impl KpiMetric {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TtftMs => "ttft_ms",
            Self::TokS => "tok_s",
            Self::MemPeakMb => "mem_peak_mb",
        }
    }
}

impl fmt::Display for KpiMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    AtMost,
    AtLeast,
}

impl Comparison {
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::AtMost => "<=",
            Self::AtLeast => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub op: Comparison,
    pub limit: f64,
}

impl Threshold {
    #[must_use]
    pub const fn at_most(limit: f64) -> Self {
        Self {
            op: Comparison::AtMost,
            limit,
        }
    }

    #[must_use]
    pub const fn at_least(limit: f64) -> Self {
        Self {
            op: Comparison::AtLeast,
            limit,
        }
    }

    #[must_use]
    pub fn admits(&self, value: f64) -> bool {
        match self.op {
            Comparison::AtMost => value <= self.limit,
            Comparison::AtLeast => value >= self.limit,
        }
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op.symbol(), self.limit)
    }
}

/// A probe reading. `Unmeasured` is never coerced into a number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KpiValue {
    Measured(f64),
    Unmeasured { reason: String },
}

impl KpiValue {
    #[must_use]
    pub fn unmeasured(reason: impl Into<String>) -> Self {
        Self::Unmeasured {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn as_measured(&self) -> Option<f64> {
        match self {
            Self::Measured(value) => Some(*value),
            Self::Unmeasured { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiSample {
    pub metric: KpiMetric,
    pub value: KpiValue,
    pub threshold: Threshold,
    pub gate: GateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl KpiSample {
    /// Scores `value` against `threshold`; the gate is derived, never passed in.
    #[must_use]
    pub fn score(metric: KpiMetric, value: KpiValue, threshold: Threshold) -> Self {
        let gate = match value.as_measured() {
            Some(measured) if measured.is_finite() && threshold.admits(measured) => GateStatus::Pass,
            Some(_) => GateStatus::Fail,
            None => GateStatus::Unknown,
        };
        Self {
            metric,
            value,
            threshold,
            gate,
            note: None,
        }
    }

    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

// ── Artifact & manifest ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactFormat {
    Pte,
    Onnx,
    Gguf,
    Unknown,
}

impl ArtifactFormat {
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("pte") => Self::Pte,
            Some("onnx") => Self::Onnx,
            Some("gguf") => Self::Gguf,
            _ => Self::Unknown,
        }
    }

    /// Key prefix used by the export tooling in sidecar manifests
    /// (`pte_file`, `pte_size_bytes`, ...).
    #[must_use]
    pub const fn manifest_prefix(self) -> &'static str {
        match self {
            Self::Pte => "pte",
            Self::Onnx => "onnx",
            Self::Gguf => "gguf",
            Self::Unknown => "model",
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pte => "pte",
            Self::Onnx => "onnx",
            Self::Gguf => "gguf",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub size_bytes: Option<u64>,
    /// Only populated once the hash has been verified against a manifest.
    pub content_hash: Option<String>,
    pub format: ArtifactFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_hex: Option<String>,
}

impl Artifact {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let format = ArtifactFormat::from_path(&path);
        Self {
            path,
            size_bytes: None,
            content_hash: None,
            format,
            header_hex: None,
        }
    }

    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }
}

/// Sidecar manifest written by the export step. Untrusted: every field is
/// optional and cross-checked, never corrected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(
        default,
        alias = "pte_file",
        alias = "onnx_file",
        alias = "gguf_file"
    )]
    pub model_file: Option<String>,
    #[serde(
        default,
        rename = "file_size_bytes",
        alias = "pte_size_bytes",
        alias = "onnx_size_bytes",
        alias = "gguf_size_bytes",
        alias = "model_size_bytes"
    )]
    pub declared_size_bytes: Option<u64>,
    #[serde(default, rename = "sha256")]
    pub declared_hash: Option<String>,
    #[serde(default, rename = "quantization")]
    pub quantization_label: Option<String>,
    #[serde(default)]
    pub sequence_length: Option<u32>,
    #[serde(default)]
    pub optimizations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
}

impl Manifest {
    pub fn from_json_str(text: &str) -> Result<Self, TypeError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Declared hash lower-cased with an optional `sha256:` prefix removed.
    #[must_use]
    pub fn normalized_hash(&self) -> Option<String> {
        self.declared_hash.as_deref().map(normalize_hex_digest)
    }
}

#[must_use]
pub fn normalize_hex_digest(value: &str) -> String {
    let trimmed = value.trim();
    trimmed
        .strip_prefix("sha256:")
        .unwrap_or(trimmed)
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::{
        ArtifactFormat, Comparison, CoverageEstimate, Confidence, GateStatus, KpiMetric,
        KpiSample, KpiValue, Manifest, OverallStatus, Threshold, bytes_to_mib,
    };
    use std::path::Path;

    #[test]
    fn overall_status_exit_codes_are_stable() {
        assert_eq!(OverallStatus::Pass.exit_code(), 0);
        assert_eq!(OverallStatus::Fail.exit_code(), 1);
        assert_eq!(OverallStatus::Incomplete.exit_code(), 2);
    }

    #[test]
    fn unmeasured_value_scores_unknown_not_fail() {
        let sample = KpiSample::score(
            KpiMetric::TtftMs,
            KpiValue::unmeasured("runtime unavailable"),
            Threshold::at_most(350.0),
        );
        assert_eq!(sample.gate, GateStatus::Unknown);
    }

    #[test]
    fn measured_values_respect_operator_direction() {
        let ttft = KpiSample::score(
            KpiMetric::TtftMs,
            KpiValue::Measured(351.0),
            Threshold::at_most(350.0),
        );
        assert_eq!(ttft.gate, GateStatus::Fail);

        let tok_s = KpiSample::score(KpiMetric::TokS, KpiValue::Measured(10.0), Threshold::at_least(10.0));
        assert_eq!(tok_s.gate, GateStatus::Pass);
        assert_eq!(tok_s.threshold.op, Comparison::AtLeast);
    }

    #[test]
    fn nan_measurement_never_passes() {
        let sample = KpiSample::score(
            KpiMetric::MemPeakMb,
            KpiValue::Measured(f64::NAN),
            Threshold::at_most(3500.0),
        );
        assert_eq!(sample.gate, GateStatus::Fail);
    }

    #[test]
    fn coverage_ratio_is_bounded() {
        assert!(CoverageEstimate::new(1.2, Confidence::High, "x").is_err());
        assert!(CoverageEstimate::new(0.95, Confidence::High, "x").is_ok());
    }

    #[test]
    fn manifest_accepts_format_specific_keys() {
        let manifest = Manifest::from_json_str(
            r#"{
                "model_id": "meta-llama/Llama-3.2-1B",
                "pte_file": "model.pte",
                "pte_size_bytes": 1234,
                "sha256": "SHA256:ABCDEF",
                "quantization": "int8",
                "sequence_length": 512,
                "optimizations": ["xnnpack", "kv-cache"]
            }"#,
        )
        .expect("manifest");
        assert_eq!(manifest.model_file.as_deref(), Some("model.pte"));
        assert_eq!(manifest.declared_size_bytes, Some(1234));
        assert_eq!(manifest.normalized_hash().as_deref(), Some("abcdef"));
        assert_eq!(manifest.optimizations, vec!["xnnpack", "kv-cache"]);
    }

    #[test]
    fn manifest_tolerates_unknown_fields() {
        let manifest = Manifest::from_json_str(
            r#"{"model_id":"m","file_size_bytes":1,"file_size_gb":0.0,"backend":"CPU"}"#,
        )
        .expect("manifest");
        assert_eq!(manifest.declared_size_bytes, Some(1));
        assert!(manifest.declared_hash.is_none());
    }

    #[test]
    fn artifact_format_follows_extension() {
        assert_eq!(ArtifactFormat::from_path(Path::new("a/model.PTE")), ArtifactFormat::Pte);
        assert_eq!(ArtifactFormat::from_path(Path::new("m.gguf")), ArtifactFormat::Gguf);
        assert_eq!(ArtifactFormat::from_path(Path::new("m.bin")), ArtifactFormat::Unknown);
    }

    #[test]
    fn mib_conversion_uses_binary_units() {
        assert!((bytes_to_mib(900 * 1024 * 1024) - 900.0).abs() < f64::EPSILON);
    }
}
