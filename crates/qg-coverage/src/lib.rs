#![forbid(unsafe_code)]

//! Heuristic INT8 coverage estimation.
//!
//! Without a runtime that can walk the exported graph, the only signal is the
//! file itself. Size bands map to a coverage ratio and a confidence; a byte
//! histogram over a leading window is kept as evidence but never decides.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use qg_guards::{ByteProfile, DEFAULT_CHUNK_SIZE, profile_leading_window};
use qg_types::{
    BYTES_PER_GIB, BYTES_PER_MIB, Confidence, CoverageEstimate, GateStatus, TypeError,
    bytes_to_gib,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_FAMILY: &str = "llama3.2-1b";
pub const DEFAULT_TARGET_COVERAGE: f64 = 0.90;
pub const DEFAULT_SAMPLE_WINDOW_BYTES: u64 = BYTES_PER_MIB;
pub const SIZE_HEURISTIC_METHOD: &str = "size-heuristic";

/// Bytes per parameter for an INT8 export including scales and embeddings.
const INT8_BYTES_PER_PARAM: f64 = 1.2;
const FP32_BYTES_PER_PARAM: f64 = 4.0;

#[derive(Debug, Error)]
pub enum CoverageError {
    #[error("unknown model family {0:?}")]
    UnknownFamily(String),
    #[error("family {family}: size bands must satisfy 0 < high_max_gb <= mixed_max_gb")]
    BandOrder { family: String },
    #[error("family {family}: ratios must be non-increasing from high to low")]
    RatioOrder { family: String },
    #[error("target coverage {0} is outside [0, 1]")]
    TargetOutOfRange(f64),
    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Size bands and ratios for one model family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageProfile {
    pub parameter_count: f64,
    pub high_max_gb: f64,
    pub mixed_max_gb: f64,
    pub high_ratio: f64,
    pub mixed_ratio: f64,
    pub low_ratio: f64,
}

impl CoverageProfile {
    #[must_use]
    pub fn with_parameters(parameter_count: f64) -> Self {
        Self {
            parameter_count,
            high_max_gb: 2.0,
            mixed_max_gb: 3.0,
            high_ratio: 0.95,
            mixed_ratio: 0.70,
            low_ratio: 0.30,
        }
    }

    pub fn validate(&self, family: &str) -> Result<(), CoverageError> {
        if !(self.high_max_gb > 0.0 && self.high_max_gb <= self.mixed_max_gb) {
            return Err(CoverageError::BandOrder {
                family: family.to_owned(),
            });
        }
        let ratios = [self.high_ratio, self.mixed_ratio, self.low_ratio];
        if ratios.iter().any(|r| !(0.0..=1.0).contains(r))
            || self.high_ratio < self.mixed_ratio
            || self.mixed_ratio < self.low_ratio
        {
            return Err(CoverageError::RatioOrder {
                family: family.to_owned(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn expected_int8_gb(&self) -> f64 {
        self.parameter_count * INT8_BYTES_PER_PARAM / BYTES_PER_GIB as f64
    }

    #[must_use]
    pub fn expected_fp32_gb(&self) -> f64 {
        self.parameter_count * FP32_BYTES_PER_PARAM / BYTES_PER_GIB as f64
    }

    /// Band lookup. Non-increasing in `size_bytes` for a valid profile.
    pub fn estimate(&self, size_bytes: u64) -> Result<CoverageEstimate, CoverageError> {
        let size_gb = bytes_to_gib(size_bytes);
        let (ratio, confidence) = if size_gb < self.high_max_gb {
            (self.high_ratio, Confidence::High)
        } else if size_gb < self.mixed_max_gb {
            (self.mixed_ratio, Confidence::Medium)
        } else {
            (self.low_ratio, Confidence::Low)
        };
        Ok(CoverageEstimate::new(
            ratio,
            confidence,
            SIZE_HEURISTIC_METHOD,
        )?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageConfig {
    pub family: String,
    pub target_coverage: f64,
    pub sample_window_bytes: u64,
    pub families: BTreeMap<String, CoverageProfile>,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        let mut families = BTreeMap::new();
        families.insert(
            DEFAULT_FAMILY.to_owned(),
            CoverageProfile::with_parameters(1.23e9),
        );
        families.insert("gemma3-1b".to_owned(), CoverageProfile::with_parameters(1.0e9));
        Self {
            family: DEFAULT_FAMILY.to_owned(),
            target_coverage: DEFAULT_TARGET_COVERAGE,
            sample_window_bytes: DEFAULT_SAMPLE_WINDOW_BYTES,
            families,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageDiagnostics {
    pub size_gb: f64,
    pub expected_int8_gb: f64,
    pub expected_fp32_gb: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<ByteProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageVerdict {
    pub family: String,
    pub target_coverage: f64,
    pub estimate: Option<CoverageEstimate>,
    pub validation_status: GateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<CoverageDiagnostics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unavailable_reason: Option<String>,
}

impl CoverageVerdict {
    /// Advisory lines, in the order they should be printed.
    #[must_use]
    pub fn recommendations(&self) -> Vec<String> {
        let size = self
            .diagnostics
            .as_ref()
            .map(|d| format!("{:.3} GB", d.size_gb))
            .unwrap_or_else(|| "unknown size".to_owned());
        match self.validation_status {
            GateStatus::Pass => vec![
                format!("File size ({size}) consistent with an INT8 model"),
                "Proceed with runtime validation (TTFT/tok_s)".to_owned(),
            ],
            GateStatus::Fail => vec![
                format!("File size ({size}) larger than expected for INT8; model may not be properly quantized"),
                "Verify the export script applied quantization".to_owned(),
                "Check export logs for quantization ops".to_owned(),
                "Re-export with explicit INT8 quantization".to_owned(),
            ],
            GateStatus::Unknown => vec![
                "Unable to determine quantization coverage".to_owned(),
                "Check the export manifest for quantization metadata".to_owned(),
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoverageEstimator {
    family: String,
    profile: CoverageProfile,
    target_coverage: f64,
    sample_window_bytes: u64,
}

impl CoverageEstimator {
    pub fn from_config(config: &CoverageConfig) -> Result<Self, CoverageError> {
        let profile = config
            .families
            .get(&config.family)
            .ok_or_else(|| CoverageError::UnknownFamily(config.family.clone()))?;
        profile.validate(&config.family)?;
        if !(0.0..=1.0).contains(&config.target_coverage) {
            return Err(CoverageError::TargetOutOfRange(config.target_coverage));
        }
        Ok(Self {
            family: config.family.clone(),
            profile: profile.clone(),
            target_coverage: config.target_coverage,
            sample_window_bytes: config.sample_window_bytes,
        })
    }

    #[must_use]
    pub fn profile(&self) -> &CoverageProfile {
        &self.profile
    }

    /// Pure size-only verdict; no byte sample.
    pub fn judge_size(&self, size_bytes: u64) -> Result<CoverageVerdict, CoverageError> {
        let estimate = self.profile.estimate(size_bytes)?;
        let validation_status = if estimate.ratio >= self.target_coverage {
            GateStatus::Pass
        } else {
            GateStatus::Fail
        };
        Ok(CoverageVerdict {
            family: self.family.clone(),
            target_coverage: self.target_coverage,
            estimate: Some(estimate),
            validation_status,
            diagnostics: Some(CoverageDiagnostics {
                size_gb: bytes_to_gib(size_bytes),
                expected_int8_gb: self.profile.expected_int8_gb(),
                expected_fp32_gb: self.profile.expected_fp32_gb(),
                sample: None,
            }),
            unavailable_reason: None,
        })
    }

    /// Estimates from the file on disk. An unreadable file yields `UNKNOWN`
    /// with no estimate; a failed sample only drops the evidence.
    pub fn judge_path(&self, path: &Path) -> Result<CoverageVerdict, CoverageError> {
        let size_bytes = match fs::metadata(path) {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return Ok(self.unknown(format!("{} is not a regular file", path.display()))),
            Err(err) => return Ok(self.unknown(format!("cannot stat {}: {err}", path.display()))),
        };
        let mut verdict = self.judge_size(size_bytes)?;
        let sample = profile_leading_window(path, self.sample_window_bytes, DEFAULT_CHUNK_SIZE).ok();
        if let Some(diagnostics) = verdict.diagnostics.as_mut() {
            diagnostics.sample = sample;
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(
            family = %self.family,
            status = ?verdict.validation_status,
            "coverage estimated"
        );
        Ok(verdict)
    }

    fn unknown(&self, reason: String) -> CoverageVerdict {
        CoverageVerdict {
            family: self.family.clone(),
            target_coverage: self.target_coverage,
            estimate: None,
            validation_status: GateStatus::Unknown,
            diagnostics: None,
            unavailable_reason: Some(reason),
        }
    }
}
