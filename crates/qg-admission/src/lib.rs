#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use qg_coverage::{CoverageConfig, CoverageError, CoverageEstimator, CoverageVerdict};
use qg_guards::{GuardChain, GuardChainOutcome, GuardConfig, GuardError};
use qg_integrity::{
    DEFAULT_CHUNK_SIZE, INTEGRITY_STAGE, IntegrityError, IntegrityVerdict, ManifestSource,
    Sha256StreamHasher, load_manifest, manifest_target_check, resolve_manifest_source,
    verify_artifact,
};
use qg_kpi::{DeviceFitConfig, KpiConfig, KpiEvaluator, KpiOutcome, RamEstimate, estimate_ram};
use qg_types::{
    Artifact, ArtifactFormat, BYTES_PER_GIB, CheckCategory, FindingKind, GateStatus, GuardResult,
    GuardStatus, KpiSample, KpiValue, OverallStatus, Severity, bytes_to_gib,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const GUARDS_STAGE: &str = "guards";
pub const COVERAGE_STAGE: &str = "coverage";
pub const KPI_STAGE: &str = "kpi";
pub const DEVICE_FIT_STAGE: &str = "device-fit";

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("cannot read config {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error(transparent)]
    Coverage(#[from] CoverageError),
    #[error("invalid override: {0}")]
    InvalidOverride(String),
    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

// ── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    pub chunk_size: usize,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub integrity: IntegrityConfig,
    pub guards: GuardConfig,
    pub coverage: CoverageConfig,
    pub kpi: KpiConfig,
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub max_size_gb: Option<f64>,
    pub target_coverage: Option<f64>,
    pub model_family: Option<String>,
    pub device_budget_mb: Option<f64>,
    pub tokenizer: Option<PathBuf>,
    pub probe_timeout_ms: Option<u64>,
}

impl AdmissionConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, AdmissionError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, AdmissionError> {
        let text = fs::read_to_string(path).map_err(|source| AdmissionError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn apply(&mut self, overrides: &ConfigOverrides) -> Result<(), AdmissionError> {
        if let Some(gb) = overrides.max_size_gb {
            if !(gb.is_finite() && gb > 0.0) {
                return Err(AdmissionError::InvalidOverride(format!(
                    "--max-size-gb must be positive, got {gb}"
                )));
            }
            self.guards.max_size_bytes = Some((gb * BYTES_PER_GIB as f64).round() as u64);
        }
        if let Some(target) = overrides.target_coverage {
            if !(0.0..=1.0).contains(&target) {
                return Err(AdmissionError::InvalidOverride(format!(
                    "--target-coverage must be within [0, 1], got {target}"
                )));
            }
            self.coverage.target_coverage = target;
        }
        if let Some(family) = &overrides.model_family {
            self.coverage.family = family.clone();
        }
        if let Some(budget) = overrides.device_budget_mb {
            if !(budget.is_finite() && budget > 0.0) {
                return Err(AdmissionError::InvalidOverride(format!(
                    "--device-budget-mb must be positive, got {budget}"
                )));
            }
            self.kpi.device.budget_mb = budget;
        }
        if let Some(tokenizer) = &overrides.tokenizer {
            self.kpi.tokenizer = Some(tokenizer.clone());
        }
        if let Some(timeout) = overrides.probe_timeout_ms {
            self.kpi.probe_timeout_ms = timeout;
        }
        Ok(())
    }
}

// ── Aggregation ─────────────────────────────────────────────────────────────

/// Reduces every signal into one tri-state decision.
///
/// `FAIL` iff some guard result or KPI sample failed. Otherwise `PASS` iff no
/// hard check is left at `WARN` and no KPI is `UNKNOWN`. Coverage and device
/// fit take part through the results [`coverage_result`] and
/// [`device_fit_result`] add to `guards`.
#[must_use]
pub fn overall_status(guards: &[GuardResult], kpis: &[KpiSample]) -> OverallStatus {
    let failed = guards
        .iter()
        .any(|result| result.status == GuardStatus::Fail)
        || kpis.iter().any(|sample| sample.gate == GateStatus::Fail);
    if failed {
        return OverallStatus::Fail;
    }

    let hard_unsettled = guards
        .iter()
        .any(|result| result.is_hard() && result.status == GuardStatus::Warn);
    let kpi_unknown = kpis.iter().any(|sample| sample.gate == GateStatus::Unknown);

    if hard_unsettled || kpi_unknown {
        OverallStatus::Incomplete
    } else {
        OverallStatus::Pass
    }
}

/// Coverage as a check. A heuristic shortfall is advisory (soft `WARN`); no
/// estimate at all leaves the decision open (hard `WARN`).
#[must_use]
pub fn coverage_result(verdict: &CoverageVerdict) -> GuardResult {
    let expected = format!(">= {:.2}", verdict.target_coverage);
    match (verdict.validation_status, &verdict.estimate) {
        (GateStatus::Pass, Some(estimate)) => GuardResult::pass(
            COVERAGE_STAGE,
            CheckCategory::Coverage,
            Severity::Soft,
            format!("estimated ratio {:.2} ({})", estimate.ratio, estimate.confidence),
        ),
        (GateStatus::Fail, Some(estimate)) => GuardResult::finding(
            COVERAGE_STAGE,
            CheckCategory::Coverage,
            Severity::Soft,
            GuardStatus::Warn,
            FindingKind::CoverageBelowTarget,
            format!(
                "heuristic estimate below target ({}, {})",
                estimate.confidence, estimate.method
            ),
        )
        .with_values(format!("{:.2}", estimate.ratio), expected),
        _ => GuardResult::finding(
            COVERAGE_STAGE,
            CheckCategory::Coverage,
            Severity::Hard,
            GuardStatus::Warn,
            FindingKind::CoverageUnavailable,
            verdict
                .unavailable_reason
                .clone()
                .unwrap_or_else(|| "no coverage estimate".to_owned()),
        ),
    }
}

/// Device fit as a check. The RAM figure is an estimate, so a misfit is a
/// soft `WARN`.
#[must_use]
pub fn device_fit_result(fit: &RamEstimate) -> GuardResult {
    let observed = format!("{:.0} MB", fit.required_ram_mb);
    let expected = format!("<= {:.0} MB", fit.device_budget_mb);
    if fit.fits {
        GuardResult::pass(
            DEVICE_FIT_STAGE,
            CheckCategory::DeviceFit,
            Severity::Soft,
            format!("required {observed} within budget"),
        )
    } else {
        GuardResult::finding(
            DEVICE_FIT_STAGE,
            CheckCategory::DeviceFit,
            Severity::Soft,
            GuardStatus::Warn,
            FindingKind::DeviceBudgetExceeded,
            "estimated RAM exceeds the device budget",
        )
        .with_values(observed, expected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub category: CheckCategory,
    pub message: String,
}

/// Fixed advice per finding. Coverage and device-fit findings get theirs from
/// the verdict itself, so they have none here.
fn finding_advice(kind: FindingKind) -> Option<&'static str> {
    let advice = match kind {
        FindingKind::FileNotFound => {
            "Check the artifact path; re-run the export step if the file was never produced"
        }
        FindingKind::EmptyArtifact => "Export produced an empty file; re-run it and check its logs",
        FindingKind::BufferReadError => {
            "Artifact could not be read in full; check the storage medium and copy it again"
        }
        FindingKind::HashMismatch => {
            "Content hash differs from the manifest; re-copy or re-export the artifact and regenerate manifest.json"
        }
        FindingKind::SizeMismatch => {
            "File size differs from the manifest; the artifact is truncated or the manifest is stale"
        }
        FindingKind::SizeCeilingExceeded => {
            "Artifact exceeds the size ceiling; re-export with stronger quantization or raise --max-size-gb"
        }
        FindingKind::IntegrityUnverifiable => {
            "Integrity could not be verified; see the structural checks for the cause"
        }
        FindingKind::NoManifest => {
            "No manifest found; run emit-manifest at export time so the content hash can be verified"
        }
        FindingKind::ManifestTargetMismatch => {
            "Manifest describes a different file; regenerate it for this artifact"
        }
        FindingKind::ImplausiblySmall => {
            "Artifact is smaller than any expected quantized model; check that the export completed"
        }
        FindingKind::LowEntropy => {
            "Leading bytes look like padding or zero-fill; check that the export wrote real weights"
        }
        FindingKind::CoverageBelowTarget
        | FindingKind::CoverageUnavailable
        | FindingKind::DeviceBudgetExceeded => return None,
    };
    Some(advice)
}

fn metric_list(kpis: &[KpiSample], gate: GateStatus) -> Vec<&'static str> {
    kpis.iter()
        .filter(|sample| sample.gate == gate)
        .map(|sample| sample.metric.as_str())
        .collect()
}

/// Ordered advice keyed by the failing category. Same inputs, same list.
#[must_use]
pub fn recommendations(
    guards: &[GuardResult],
    coverage: Option<&CoverageVerdict>,
    kpis: &[KpiSample],
    device_fit: Option<&RamEstimate>,
) -> Vec<Recommendation> {
    let mut out: Vec<Recommendation> = Vec::new();
    let mut push = |category: CheckCategory, message: String| {
        if !out
            .iter()
            .any(|rec| rec.category == category && rec.message == message)
        {
            out.push(Recommendation { category, message });
        }
    };

    for result in guards.iter().filter(|r| r.status != GuardStatus::Pass) {
        if let Some(advice) = result.kind.and_then(finding_advice) {
            push(result.category, advice.to_owned());
        }
    }

    if let Some(verdict) = coverage.filter(|v| v.validation_status != GateStatus::Pass) {
        for line in verdict.recommendations() {
            push(CheckCategory::Coverage, line);
        }
    }

    let failed = metric_list(kpis, GateStatus::Fail);
    if !failed.is_empty() {
        push(
            CheckCategory::Kpi,
            format!(
                "KPI gate failed for {}; review bottlenecks, then re-export or tune the runtime",
                failed.join(", ")
            ),
        );
    }
    let unknown = metric_list(kpis, GateStatus::Unknown);
    if !unknown.is_empty() {
        push(
            CheckCategory::Kpi,
            format!(
                "KPI unmeasured for {}; configure kpi.runtime and a tokenizer, or measure on the target device",
                unknown.join(", ")
            ),
        );
    }

    if let Some(fit) = device_fit.filter(|fit| !fit.fits) {
        push(
            CheckCategory::DeviceFit,
            format!(
                "Required RAM {:.0} MB exceeds the {:.0} MB device budget; re-export with stronger quantization",
                fit.required_ram_mb, fit.device_budget_mb
            ),
        );
    }

    out.sort_by_key(|rec| rec.category);
    out
}

// ── Report ──────────────────────────────────────────────────────────────────

/// The one externally visible result of an invocation. Only constructed by
/// [`AdmissionReportBuilder::build`]; read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdmissionReport {
    artifact: Artifact,
    #[serde(skip_serializing_if = "Option::is_none")]
    manifest: Option<PathBuf>,
    stages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    integrity: Option<IntegrityVerdict>,
    guard_results: Vec<GuardResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    coverage: Option<CoverageVerdict>,
    kpi_samples: Vec<KpiSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kpi_runtime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_fit: Option<RamEstimate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    halted_at: Option<String>,
    overall_status: OverallStatus,
    recommendations: Vec<Recommendation>,
}

impl AdmissionReport {
    #[must_use]
    pub fn artifact(&self) -> &Artifact {
        &self.artifact
    }

    #[must_use]
    pub fn manifest(&self) -> Option<&Path> {
        self.manifest.as_deref()
    }

    #[must_use]
    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    #[must_use]
    pub fn integrity(&self) -> Option<&IntegrityVerdict> {
        self.integrity.as_ref()
    }

    #[must_use]
    pub fn guard_results(&self) -> &[GuardResult] {
        &self.guard_results
    }

    #[must_use]
    pub fn coverage(&self) -> Option<&CoverageVerdict> {
        self.coverage.as_ref()
    }

    #[must_use]
    pub fn coverage_estimate(&self) -> Option<&qg_types::CoverageEstimate> {
        self.coverage.as_ref().and_then(|c| c.estimate.as_ref())
    }

    #[must_use]
    pub fn kpi_samples(&self) -> &[KpiSample] {
        &self.kpi_samples
    }

    #[must_use]
    pub fn device_fit(&self) -> Option<&RamEstimate> {
        self.device_fit.as_ref()
    }

    #[must_use]
    pub fn halted_at(&self) -> Option<&str> {
        self.halted_at.as_deref()
    }

    #[must_use]
    pub fn overall_status(&self) -> OverallStatus {
        self.overall_status
    }

    #[must_use]
    pub fn recommendations(&self) -> &[Recommendation] {
        &self.recommendations
    }

    #[must_use]
    pub fn exit_code(&self) -> u8 {
        self.overall_status.exit_code()
    }

    /// First finding of the given kind, if any check raised it.
    #[must_use]
    pub fn finding(&self, kind: FindingKind) -> Option<&GuardResult> {
        self.guard_results
            .iter()
            .find(|result| result.kind == Some(kind))
    }

    #[must_use]
    pub fn render_plain(&self) -> String {
        self.to_string()
    }

    pub fn to_json(&self) -> Result<String, AdmissionError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_json(&self, path: &Path) -> Result<(), AdmissionError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| AdmissionError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, self.to_json()?).map_err(|source| AdmissionError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn write_side_by_side(
    f: &mut fmt::Formatter<'_>,
    observed: Option<&str>,
    expected: Option<&str>,
) -> fmt::Result {
    if observed.is_none() && expected.is_none() {
        return Ok(());
    }
    writeln!(
        f,
        "         observed: {:<24} expected: {}",
        observed.unwrap_or("-"),
        expected.unwrap_or("-")
    )
}

impl fmt::Display for AdmissionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "artifact admission: {}", self.overall_status)?;
        writeln!(f, "  artifact: {}", self.artifact.path.display())?;
        if let Some(size) = self.artifact.size_bytes {
            writeln!(f, "  size: {size} bytes ({:.3} GB)", bytes_to_gib(size))?;
        }
        write!(f, "  format: {}", self.artifact.format.as_str())?;
        match &self.artifact.header_hex {
            Some(hex) => writeln!(f, "  header: {hex}")?,
            None => writeln!(f)?,
        }
        if let Some(hash) = &self.artifact.content_hash {
            writeln!(f, "  sha256: {hash} (verified)")?;
        }
        if let Some(manifest) = &self.manifest {
            writeln!(f, "  manifest: {}", manifest.display())?;
        }
        if let Some(stage) = &self.halted_at {
            writeln!(f, "  halted at: {stage}")?;
        }

        if !self.guard_results.is_empty() {
            writeln!(f, "checks:")?;
        }
        for result in &self.guard_results {
            let kind = result.kind.map(|k| format!(" {k}")).unwrap_or_default();
            writeln!(
                f,
                "  [{}] {}/{} ({}){kind}: {}",
                result.status,
                result.category,
                result.name,
                result.severity.as_str(),
                result.detail
            )?;
            write_side_by_side(f, result.observed.as_deref(), result.expected.as_deref())?;
        }

        if let Some(coverage) = &self.coverage {
            match &coverage.estimate {
                Some(estimate) => writeln!(
                    f,
                    "coverage: [{}] ratio {:.2} ({}, {}) family {}",
                    coverage.validation_status,
                    estimate.ratio,
                    estimate.confidence,
                    estimate.method,
                    coverage.family
                )?,
                None => writeln!(
                    f,
                    "coverage: [{}] {}",
                    coverage.validation_status,
                    coverage.unavailable_reason.as_deref().unwrap_or("no estimate")
                )?,
            }
            if let Some(diag) = &coverage.diagnostics {
                write!(
                    f,
                    "         evidence: {:.3} GB vs ~{:.2} GB INT8 / ~{:.2} GB FP32",
                    diag.size_gb, diag.expected_int8_gb, diag.expected_fp32_gb
                )?;
                match &diag.sample {
                    Some(sample) => writeln!(
                        f,
                        "; {} bytes sampled, {}/256 unique, {:.2} bits/byte",
                        sample.sampled_bytes, sample.unique_bytes, sample.entropy_bits
                    )?,
                    None => writeln!(f)?,
                }
            }
        }

        if !self.kpi_samples.is_empty() {
            writeln!(
                f,
                "kpi (runtime: {}):",
                self.kpi_runtime.as_deref().unwrap_or("none")
            )?;
        }
        for sample in &self.kpi_samples {
            let value = match &sample.value {
                KpiValue::Measured(value) => format!("{value:.2}"),
                KpiValue::Unmeasured { reason } => format!("unmeasured ({reason})"),
            };
            writeln!(
                f,
                "  [{}] {} {}: {value}",
                sample.gate, sample.metric, sample.threshold
            )?;
            if sample.gate == GateStatus::Fail {
                let observed = sample.value.as_measured().map(|v| format!("{v:.2}"));
                let expected = sample.threshold.to_string();
                write_side_by_side(f, observed.as_deref(), Some(&expected))?;
            }
            if let Some(note) = &sample.note {
                writeln!(f, "         note: {note}")?;
            }
        }

        if let Some(fit) = &self.device_fit {
            let preset = fit
                .preset
                .map(|p| format!(", preset {}", p.as_str()))
                .unwrap_or_default();
            writeln!(
                f,
                "device fit: {} (required {:.0} MB / budget {:.0} MB, headroom {:.0} MB{preset})",
                if fit.fits { "fits" } else { "exceeds budget" },
                fit.required_ram_mb,
                fit.device_budget_mb,
                fit.headroom_mb
            )?;
        }

        writeln!(f, "recommendations:")?;
        if self.recommendations.is_empty() {
            writeln!(f, "  - none; all evaluated gates passed")?;
        }
        for rec in &self.recommendations {
            writeln!(f, "  - [{}] {}", rec.category, rec.message)?;
        }
        Ok(())
    }
}

/// Collects component outputs in pipeline order and freezes them into an
/// [`AdmissionReport`].
#[derive(Debug, Clone)]
pub struct AdmissionReportBuilder {
    artifact: Artifact,
    manifest: Option<PathBuf>,
    stages: Vec<String>,
    integrity: Option<IntegrityVerdict>,
    guard_results: Vec<GuardResult>,
    coverage: Option<CoverageVerdict>,
    kpi: Option<KpiOutcome>,
    device_fit: Option<RamEstimate>,
    halted_at: Option<String>,
}

impl AdmissionReportBuilder {
    #[must_use]
    pub fn new(artifact: Artifact) -> Self {
        Self {
            artifact,
            manifest: None,
            stages: Vec::new(),
            integrity: None,
            guard_results: Vec::new(),
            coverage: None,
            kpi: None,
            device_fit: None,
            halted_at: None,
        }
    }

    pub fn manifest(&mut self, path: &Path) -> &mut Self {
        self.manifest = Some(path.to_path_buf());
        self
    }

    pub fn stage(&mut self, name: &str) -> &mut Self {
        self.stages.push(name.to_owned());
        self
    }

    pub fn integrity(&mut self, verdict: IntegrityVerdict) -> &mut Self {
        if let Some(hash) = verdict.verified_hash() {
            self.artifact.content_hash = Some(hash.to_owned());
        }
        self.guard_results.push(verdict.to_guard_result());
        self.integrity = Some(verdict);
        self
    }

    pub fn guard_result(&mut self, result: GuardResult) -> &mut Self {
        self.guard_results.push(result);
        self
    }

    pub fn guard_outcome(&mut self, outcome: GuardChainOutcome) -> &mut Self {
        if let Some(size) = outcome.facts.size_bytes {
            self.artifact.size_bytes = Some(size);
        }
        if let Some(header) = outcome.facts.header {
            if header.detected_format != ArtifactFormat::Unknown {
                self.artifact.format = header.detected_format;
            }
            self.artifact.header_hex = Some(header.hex);
        }
        self.guard_results.extend(outcome.results);
        self
    }

    pub fn coverage(&mut self, verdict: CoverageVerdict) -> &mut Self {
        self.guard_results.push(coverage_result(&verdict));
        self.coverage = Some(verdict);
        self
    }

    pub fn kpi(&mut self, outcome: KpiOutcome) -> &mut Self {
        self.kpi = Some(outcome);
        self
    }

    pub fn device_fit(&mut self, estimate: RamEstimate) -> &mut Self {
        self.guard_results.push(device_fit_result(&estimate));
        self.device_fit = Some(estimate);
        self
    }

    pub fn halted_at(&mut self, stage: &str) -> &mut Self {
        self.halted_at = Some(stage.to_owned());
        self
    }

    #[must_use]
    pub fn build(self) -> AdmissionReport {
        let (kpi_samples, kpi_runtime) = match self.kpi {
            Some(outcome) => (outcome.samples, Some(outcome.runtime)),
            None => (Vec::new(), None),
        };
        let overall_status = overall_status(&self.guard_results, &kpi_samples);
        let recommendations = recommendations(
            &self.guard_results,
            self.coverage.as_ref(),
            &kpi_samples,
            self.device_fit.as_ref(),
        );
        AdmissionReport {
            artifact: self.artifact,
            manifest: self.manifest,
            stages: self.stages,
            integrity: self.integrity,
            guard_results: self.guard_results,
            coverage: self.coverage,
            kpi_samples,
            kpi_runtime,
            device_fit: self.device_fit,
            halted_at: self.halted_at,
            overall_status,
            recommendations,
        }
    }
}

// ── Pipeline ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardScope {
    Full,
    ExistenceAndCeiling,
    Off,
}

/// Which stages an invocation runs. Order is fixed: integrity, guards,
/// coverage, kpi.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSet {
    pub integrity: bool,
    pub guards: GuardScope,
    pub coverage: bool,
    pub kpi: bool,
}

impl StageSet {
    pub const ALL: Self = Self {
        integrity: true,
        guards: GuardScope::Full,
        coverage: true,
        kpi: true,
    };
    pub const VERIFY: Self = Self {
        integrity: true,
        guards: GuardScope::ExistenceAndCeiling,
        coverage: false,
        kpi: false,
    };
    pub const GUARDS: Self = Self {
        integrity: false,
        guards: GuardScope::Full,
        coverage: false,
        kpi: false,
    };
    pub const COVERAGE: Self = Self {
        integrity: false,
        guards: GuardScope::Off,
        coverage: true,
        kpi: false,
    };
    pub const KPI: Self = Self {
        integrity: false,
        guards: GuardScope::ExistenceAndCeiling,
        coverage: false,
        kpi: true,
    };
}

pub struct AdmissionPipeline {
    hasher: Sha256StreamHasher,
    guards: Option<GuardChain>,
    coverage: Option<CoverageEstimator>,
    kpi: KpiEvaluator,
    device: DeviceFitConfig,
    stages: StageSet,
}

impl AdmissionPipeline {
    pub fn new(config: &AdmissionConfig, stages: StageSet) -> Result<Self, AdmissionError> {
        let hasher = Sha256StreamHasher::new(config.integrity.chunk_size)?;
        let guards = match stages.guards {
            GuardScope::Full => Some(GuardChain::from_config(&config.guards)?),
            GuardScope::ExistenceAndCeiling => {
                Some(GuardChain::existence_and_ceiling(&config.guards)?)
            }
            GuardScope::Off => None,
        };
        let coverage = if stages.coverage {
            Some(CoverageEstimator::from_config(&config.coverage)?)
        } else {
            None
        };
        Ok(Self {
            hasher,
            guards,
            coverage,
            kpi: KpiEvaluator::from_config(&config.kpi),
            device: config.kpi.device,
            stages,
        })
    }

    /// Replaces the configured KPI evaluator (e.g. with an in-process runtime).
    #[must_use]
    pub fn with_kpi_evaluator(mut self, evaluator: KpiEvaluator) -> Self {
        self.kpi = evaluator;
        self
    }

    /// Runs the selected stages in order, stopping after the first hard
    /// failure. Errors only on invocation problems such as a manifest that
    /// exists but cannot be read or parsed; a manifest path that does not
    /// exist is reported as `no-manifest`.
    pub fn run(
        &self,
        artifact_path: &Path,
        manifest: Option<&Path>,
    ) -> Result<AdmissionReport, AdmissionError> {
        #[cfg(feature = "tracing")]
        tracing::info!(artifact = %artifact_path.display(), "admission started");

        let mut artifact = Artifact::new(artifact_path);
        artifact.size_bytes = fs::metadata(artifact_path)
            .ok()
            .filter(fs::Metadata::is_file)
            .map(|meta| meta.len());
        let size_bytes = artifact.size_bytes;
        let mut builder = AdmissionReportBuilder::new(artifact);

        if self.stages.integrity {
            builder.stage(INTEGRITY_STAGE);
            let source = resolve_manifest_source(artifact_path, manifest);
            let manifest = match source.path() {
                Some(path) => {
                    builder.manifest(path);
                    Some(load_manifest(path)?)
                }
                None => None,
            };
            let mut verdict = verify_artifact(&self.hasher, artifact_path, manifest.as_ref());
            if let ManifestSource::Missing(path) = &source {
                verdict = verdict.manifest_missing_at(path);
            }
            let halts = verdict.to_guard_result().halts();
            builder.integrity(verdict);
            if let Some(target) = manifest
                .as_ref()
                .and_then(|m| manifest_target_check(&Artifact::new(artifact_path), m))
            {
                builder.guard_result(target);
            }
            if halts {
                #[cfg(feature = "tracing")]
                tracing::warn!(stage = INTEGRITY_STAGE, "hard failure, halting");
                builder.halted_at(INTEGRITY_STAGE);
                return Ok(builder.build());
            }
        }

        if let Some(chain) = &self.guards {
            builder.stage(GUARDS_STAGE);
            let outcome = chain.run(artifact_path);
            let halted = if outcome.halted {
                outcome.results.last().map(|r| r.name.clone())
            } else {
                None
            };
            builder.guard_outcome(outcome);
            if let Some(guard) = halted {
                #[cfg(feature = "tracing")]
                tracing::warn!(stage = GUARDS_STAGE, guard = %guard, "hard failure, halting");
                builder.halted_at(&guard);
                return Ok(builder.build());
            }
        }

        if let Some(estimator) = &self.coverage {
            builder.stage(COVERAGE_STAGE);
            builder.coverage(estimator.judge_path(artifact_path)?);
        }

        if self.stages.kpi {
            builder.stage(KPI_STAGE);
            builder.kpi(self.kpi.evaluate(artifact_path));
            if let Some(size) = size_bytes {
                builder.device_fit(estimate_ram(size, &self.device));
            }
        }

        let report = builder.build();
        #[cfg(feature = "tracing")]
        tracing::info!(status = %report.overall_status(), "admission finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use proptest::prelude::*;
    use qg_coverage::{CoverageConfig, CoverageEstimator};
    use qg_kpi::{DeviceFitConfig, KpiOutcome, estimate_ram};
    use qg_types::{
        Artifact, BYTES_PER_GIB, CheckCategory, FindingKind, GateStatus, GuardResult, GuardStatus,
        KpiMetric, KpiSample, KpiValue, OverallStatus, Severity, Threshold,
    };

    use super::{
        AdmissionConfig, AdmissionReportBuilder, ConfigOverrides, overall_status,
        recommendations,
    };

    fn guard(severity: Severity, status: GuardStatus) -> GuardResult {
        match status {
            GuardStatus::Pass => GuardResult::pass("g", CheckCategory::Structural, severity, "ok"),
            _ => GuardResult::finding(
                "g",
                CheckCategory::Structural,
                severity,
                status,
                FindingKind::LowEntropy,
                "finding",
            ),
        }
    }

    fn kpi(gate: GateStatus) -> KpiSample {
        KpiSample {
            metric: KpiMetric::TokS,
            value: KpiValue::Measured(1.0),
            threshold: Threshold::at_least(10.0),
            gate,
            note: None,
        }
    }

    fn kpi_outcome(gates: Vec<GateStatus>) -> KpiOutcome {
        KpiOutcome {
            runtime: "test".to_owned(),
            runtime_available: true,
            tokenizer_available: true,
            samples: gates.into_iter().map(kpi).collect(),
        }
    }

    fn estimator(target_coverage: f64) -> CoverageEstimator {
        CoverageEstimator::from_config(&CoverageConfig {
            target_coverage,
            ..CoverageConfig::default()
        })
        .expect("estimator")
    }

    #[test]
    fn yaml_config_overrides_only_named_fields() {
        let config = AdmissionConfig::from_yaml_str(
            "guards:\n  min_plausible_bytes: 1024\nkpi:\n  thresholds:\n    ttft_ms: 500\n",
        )
        .expect("config");
        assert_eq!(config.guards.min_plausible_bytes, 1024);
        assert!((config.guards.entropy_floor - 0.10).abs() < f64::EPSILON);
        assert!((config.kpi.thresholds.ttft_ms - 500.0).abs() < f64::EPSILON);
        assert!((config.kpi.thresholds.tok_s - 10.0).abs() < f64::EPSILON);
        assert_eq!(config.coverage.family, "llama3.2-1b");
    }

    #[test]
    fn empty_yaml_is_default() {
        assert_eq!(
            AdmissionConfig::from_yaml_str("  \n").expect("config"),
            AdmissionConfig::default()
        );
    }

    #[test]
    fn cli_overrides_win_over_file() {
        let mut config = AdmissionConfig::default();
        config
            .apply(&ConfigOverrides {
                max_size_gb: Some(2.0),
                target_coverage: Some(0.5),
                model_family: Some("gemma3-1b".to_owned()),
                device_budget_mb: Some(8192.0),
                ..ConfigOverrides::default()
            })
            .expect("apply");
        assert_eq!(config.guards.max_size_bytes, Some(2 * 1024 * 1024 * 1024));
        assert!((config.coverage.target_coverage - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.coverage.family, "gemma3-1b");
        assert!((config.kpi.device.budget_mb - 8192.0).abs() < f64::EPSILON);

        assert!(
            config
                .apply(&ConfigOverrides {
                    max_size_gb: Some(-1.0),
                    ..ConfigOverrides::default()
                })
                .is_err()
        );
    }

    #[test]
    fn soft_warning_alone_still_passes() {
        let guards = vec![
            guard(Severity::Hard, GuardStatus::Pass),
            guard(Severity::Soft, GuardStatus::Warn),
        ];
        assert_eq!(
            overall_status(&guards, &[kpi(GateStatus::Pass)]),
            OverallStatus::Pass
        );
    }

    #[test]
    fn coverage_shortfall_and_misfit_are_advisory() {
        let verdict = estimator(0.99).judge_size(64 * 1024).expect("verdict");
        assert_eq!(verdict.validation_status, GateStatus::Fail);
        let fit = estimate_ram(8 * BYTES_PER_GIB, &DeviceFitConfig::default());
        assert!(!fit.fits);

        let mut builder = AdmissionReportBuilder::new(Artifact::new("model.pte"));
        builder
            .guard_result(guard(Severity::Hard, GuardStatus::Pass))
            .coverage(verdict)
            .kpi(kpi_outcome(vec![GateStatus::Pass; 3]))
            .device_fit(fit);
        let report = builder.build();

        assert_eq!(report.overall_status(), OverallStatus::Pass);
        assert_eq!(report.exit_code(), 0);
        let shortfall = report
            .finding(FindingKind::CoverageBelowTarget)
            .expect("coverage warning");
        assert_eq!(shortfall.status, GuardStatus::Warn);
        assert_eq!(shortfall.severity, Severity::Soft);
        assert_eq!(shortfall.observed.as_deref(), Some("0.95"));
        assert_eq!(shortfall.expected.as_deref(), Some(">= 0.99"));
        let misfit = report
            .finding(FindingKind::DeviceBudgetExceeded)
            .expect("device warning");
        assert_eq!(misfit.severity, Severity::Soft);

        let categories: Vec<CheckCategory> =
            report.recommendations().iter().map(|r| r.category).collect();
        assert!(categories.contains(&CheckCategory::Coverage));
        assert!(categories.contains(&CheckCategory::DeviceFit));
    }

    #[test]
    fn missing_coverage_estimate_keeps_the_decision_open() {
        let verdict = estimator(0.90)
            .judge_path(Path::new("/nonexistent/qg/model.pte"))
            .expect("verdict");
        assert_eq!(verdict.validation_status, GateStatus::Unknown);

        let mut builder = AdmissionReportBuilder::new(Artifact::new("model.pte"));
        builder
            .coverage(verdict)
            .kpi(kpi_outcome(vec![GateStatus::Pass; 3]));
        let report = builder.build();
        let unavailable = report
            .finding(FindingKind::CoverageUnavailable)
            .expect("coverage unavailable");
        assert!(unavailable.is_hard());
        assert_eq!(report.overall_status(), OverallStatus::Incomplete);
    }

    #[test]
    fn recommendations_are_grouped_by_category() {
        let guards = vec![
            GuardResult::finding(
                "plausible-size",
                CheckCategory::Structural,
                Severity::Soft,
                GuardStatus::Warn,
                FindingKind::ImplausiblySmall,
                "small",
            ),
            GuardResult::finding(
                "integrity",
                CheckCategory::Integrity,
                Severity::Hard,
                GuardStatus::Warn,
                FindingKind::NoManifest,
                "none",
            ),
        ];
        let recs = recommendations(&guards, None, &[kpi(GateStatus::Unknown)], None);
        let categories: Vec<CheckCategory> = recs.iter().map(|r| r.category).collect();
        assert_eq!(
            categories,
            vec![
                CheckCategory::Integrity,
                CheckCategory::Structural,
                CheckCategory::Kpi
            ]
        );
        assert!(recs[2].message.contains("tok_s"));
    }

    #[test]
    fn plain_report_puts_observed_next_to_expected() {
        let mut builder = AdmissionReportBuilder::new(qg_types::Artifact::new("model.pte"));
        builder.guard_result(
            GuardResult::finding(
                "non-empty",
                CheckCategory::Structural,
                Severity::Hard,
                GuardStatus::Fail,
                FindingKind::EmptyArtifact,
                "artifact is 0 bytes",
            )
            .with_values("0 bytes", "> 0 bytes"),
        );
        let report = builder.build();
        let text = report.render_plain();
        assert!(text.starts_with("artifact admission: FAIL"));
        assert!(text.contains("[FAIL] structural/non-empty (hard) EmptyArtifact"));
        let line = text
            .lines()
            .find(|line| line.contains("observed:"))
            .expect("side-by-side line");
        assert!(line.contains("0 bytes") && line.contains("expected: > 0 bytes"));
        assert_eq!(report.exit_code(), 1);
    }

    fn guard_status() -> impl Strategy<Value = GuardStatus> {
        prop_oneof![
            Just(GuardStatus::Pass),
            Just(GuardStatus::Fail),
            Just(GuardStatus::Warn)
        ]
    }

    fn gate_status() -> impl Strategy<Value = GateStatus> {
        prop_oneof![
            Just(GateStatus::Pass),
            Just(GateStatus::Fail),
            Just(GateStatus::Unknown)
        ]
    }

    proptest! {
        #[test]
        fn overall_status_follows_the_lattice(
            guards in proptest::collection::vec((any::<bool>(), guard_status()), 0..8),
            gates in proptest::collection::vec(gate_status(), 0..4),
            coverage in proptest::option::of((0_u64..5 * BYTES_PER_GIB, 0.0_f64..=1.0)),
            device in proptest::option::of(0_u64..8 * BYTES_PER_GIB),
        ) {
            let guards: Vec<GuardResult> = guards
                .into_iter()
                .map(|(hard, status)| {
                    let severity = if hard { Severity::Hard } else { Severity::Soft };
                    guard(severity, status)
                })
                .collect();
            let kpis: Vec<KpiSample> = gates.iter().copied().map(kpi).collect();

            let mut builder = AdmissionReportBuilder::new(Artifact::new("model.pte"));
            for result in &guards {
                builder.guard_result(result.clone());
            }
            if let Some((size, target)) = coverage {
                builder.coverage(estimator(target).judge_size(size).expect("verdict"));
            }
            builder.kpi(kpi_outcome(gates));
            if let Some(size) = device {
                builder.device_fit(estimate_ram(size, &DeviceFitConfig::default()));
            }
            let report = builder.build();
            let status = report.overall_status();
            prop_assert_eq!(status, overall_status(report.guard_results(), &kpis));

            let any_fail = guards.iter().any(|g| g.status == GuardStatus::Fail)
                || kpis.iter().any(|k| k.gate == GateStatus::Fail);
            let unsettled = guards.iter().any(|g| g.is_hard() && g.status == GuardStatus::Warn)
                || kpis.iter().any(|k| k.gate == GateStatus::Unknown);

            prop_assert_eq!(status == OverallStatus::Fail, any_fail);
            prop_assert_eq!(status == OverallStatus::Pass, !any_fail && !unsettled);
        }
    }
}
