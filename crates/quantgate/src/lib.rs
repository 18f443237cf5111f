#![forbid(unsafe_code)]

//! Decides whether an exported on-device model artifact may ship.
//!
//! ```no_run
//! use quantgate::{AdmissionConfig, AdmissionPipeline, StageSet};
//!
//! let pipeline = AdmissionPipeline::new(&AdmissionConfig::default(), StageSet::ALL)?;
//! let report = pipeline.run("model.pte".as_ref(), None)?;
//! print!("{}", report.render_plain());
//! std::process::exit(i32::from(report.exit_code()));
//! # Ok::<(), quantgate::AdmissionError>(())
//! ```

pub use qg_admission as admission;
pub use qg_coverage as coverage;
pub use qg_guards as guards;
pub use qg_integrity as integrity;
pub use qg_kpi as kpi;
pub use qg_types as types;

pub use qg_admission::{
    AdmissionConfig, AdmissionError, AdmissionPipeline, AdmissionReport, AdmissionReportBuilder,
    ConfigOverrides, Recommendation, StageSet, coverage_result, device_fit_result, overall_status,
};
pub use qg_types::{
    Artifact, ArtifactFormat, Confidence, CoverageEstimate, FindingKind, GateStatus, GuardResult,
    GuardStatus, KpiMetric, KpiSample, KpiValue, Manifest, OverallStatus, Severity,
};
