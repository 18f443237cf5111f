#![forbid(unsafe_code)]

//! `qg-admit`: decides whether an exported on-device model artifact may ship.
//!
//! Exit codes: 0 PASS, 1 FAIL, 2 INCOMPLETE/UNKNOWN, 3 invocation error.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use qg_admission::{
    AdmissionConfig, AdmissionPipeline, AdmissionReport, ConfigOverrides, StageSet,
};
use qg_integrity::{
    MANIFEST_FILE_NAME, ManifestDraft, Sha256StreamHasher, build_manifest, write_manifest,
};
use qg_kpi::estimate_ram;
use qg_types::GateStatus;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_INVOCATION_ERROR: u8 = 3;

/// Admission gate for quantized on-device model artifacts (.pte, .onnx, .gguf)
#[derive(Parser)]
#[command(name = "qg-admit")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable debug logging on stderr (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// YAML configuration file; command-line flags override it
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write the JSON mirror of the report to this path
    #[arg(long, global = true, value_name = "PATH")]
    json_output: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ManifestArgs {
    /// Artifact to check
    artifact: PathBuf,

    /// Sidecar manifest (default: manifest.json beside the artifact)
    #[arg(long, value_name = "PATH")]
    manifest: Option<PathBuf>,
}

#[derive(Args)]
struct KpiArgs {
    /// Tokenizer file; throughput stays unmeasured without one
    #[arg(long, value_name = "PATH")]
    tokenizer: Option<PathBuf>,

    /// Device RAM budget in MB for the fit estimate
    #[arg(long, value_name = "MB")]
    device_budget_mb: Option<f64>,

    /// Per-probe timeout in milliseconds
    #[arg(long, value_name = "MS")]
    probe_timeout_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline: integrity, guards, coverage and KPI gates
    Admit {
        #[command(flatten)]
        target: ManifestArgs,

        /// Fail when the artifact is larger than this many GB
        #[arg(long, value_name = "GB")]
        max_size_gb: Option<f64>,

        /// Minimum estimated INT8 coverage
        #[arg(long, value_name = "RATIO")]
        target_coverage: Option<f64>,

        /// Coverage profile to use
        #[arg(long, value_name = "NAME")]
        model_family: Option<String>,

        #[command(flatten)]
        kpi: KpiArgs,
    },

    /// Verify the content hash and size against the manifest
    Verify {
        #[command(flatten)]
        target: ManifestArgs,

        /// Fail when the artifact is larger than this many GB
        #[arg(long, value_name = "GB")]
        max_size_gb: Option<f64>,
    },

    /// Run the structural guard chain only
    Guards {
        /// Artifact to check
        artifact: PathBuf,

        /// Fail when the artifact is larger than this many GB
        #[arg(long, value_name = "GB")]
        max_size_gb: Option<f64>,
    },

    /// Estimate INT8 quantization coverage; exit code follows validation_status
    Coverage {
        /// Artifact to check
        artifact: PathBuf,

        /// Minimum estimated INT8 coverage
        #[arg(long, value_name = "RATIO")]
        target_coverage: Option<f64>,

        /// Coverage profile to use
        #[arg(long, value_name = "NAME")]
        model_family: Option<String>,
    },

    /// Run the KPI probes and the device RAM fit
    Kpi {
        /// Artifact to check
        artifact: PathBuf,

        #[command(flatten)]
        kpi: KpiArgs,
    },

    /// Hash an artifact and write its sidecar manifest
    EmitManifest {
        /// Artifact to describe
        artifact: PathBuf,

        /// Model identifier recorded in the manifest
        #[arg(long)]
        model_id: String,

        /// Quantization label, e.g. int8 or q4_0
        #[arg(long)]
        quantization: Option<String>,

        #[arg(long)]
        sequence_length: Option<u32>,

        /// Runtime the artifact targets, e.g. executorch or llama.cpp
        #[arg(long)]
        runtime: Option<String>,

        /// Optimization tag; repeat for several
        #[arg(long = "optimization", value_name = "TAG")]
        optimizations: Vec<String>,

        /// Output path (default: manifest.json beside the artifact)
        #[arg(long, short, value_name = "PATH")]
        output: Option<PathBuf>,

        /// Device RAM budget in MB for the fit estimate
        #[arg(long, value_name = "MB")]
        device_budget_mb: Option<f64>,
    },
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() {
                EXIT_INVOCATION_ERROR
            } else {
                0
            };
            let _ = err.print();
            return ExitCode::from(code);
        }
    };

    init_tracing(cli.verbose);

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(error) => {
            eprintln!("qg-admit error: {error}");
            ExitCode::from(EXIT_INVOCATION_ERROR)
        }
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn load_config(
    path: Option<&Path>,
    overrides: &ConfigOverrides,
) -> Result<AdmissionConfig, Box<dyn std::error::Error>> {
    let mut config = match path {
        Some(path) => AdmissionConfig::load(path)?,
        None => AdmissionConfig::default(),
    };
    config.apply(overrides)?;
    tracing::debug!(family = %config.coverage.family, "configuration loaded");
    Ok(config)
}

fn run(cli: Cli) -> Result<u8, Box<dyn std::error::Error>> {
    let config_path = cli.config.as_deref();
    let json_output = cli.json_output.as_deref();

    match cli.command {
        Commands::Admit {
            target,
            max_size_gb,
            target_coverage,
            model_family,
            kpi,
        } => {
            let overrides = ConfigOverrides {
                max_size_gb,
                target_coverage,
                model_family,
                ..kpi_overrides(kpi)
            };
            let report = admit(
                config_path,
                &overrides,
                StageSet::ALL,
                &target.artifact,
                target.manifest.as_deref(),
            )?;
            finish(&report, json_output)?;
            Ok(report.exit_code())
        }
        Commands::Verify {
            target,
            max_size_gb,
        } => {
            let overrides = ConfigOverrides {
                max_size_gb,
                ..ConfigOverrides::default()
            };
            let report = admit(
                config_path,
                &overrides,
                StageSet::VERIFY,
                &target.artifact,
                target.manifest.as_deref(),
            )?;
            finish(&report, json_output)?;
            Ok(report.exit_code())
        }
        Commands::Guards {
            artifact,
            max_size_gb,
        } => {
            let overrides = ConfigOverrides {
                max_size_gb,
                ..ConfigOverrides::default()
            };
            let report = admit(config_path, &overrides, StageSet::GUARDS, &artifact, None)?;
            finish(&report, json_output)?;
            Ok(report.exit_code())
        }
        Commands::Coverage {
            artifact,
            target_coverage,
            model_family,
        } => {
            let overrides = ConfigOverrides {
                target_coverage,
                model_family,
                ..ConfigOverrides::default()
            };
            let report = admit(config_path, &overrides, StageSet::COVERAGE, &artifact, None)?;
            finish(&report, json_output)?;
            let status = report
                .coverage()
                .map_or(GateStatus::Unknown, |coverage| coverage.validation_status);
            Ok(status.exit_code())
        }
        Commands::Kpi { artifact, kpi } => {
            let overrides = kpi_overrides(kpi);
            let report = admit(config_path, &overrides, StageSet::KPI, &artifact, None)?;
            finish(&report, json_output)?;
            Ok(report.exit_code())
        }
        Commands::EmitManifest {
            artifact,
            model_id,
            quantization,
            sequence_length,
            runtime,
            optimizations,
            output,
            device_budget_mb,
        } => {
            let overrides = ConfigOverrides {
                device_budget_mb,
                ..ConfigOverrides::default()
            };
            let config = load_config(config_path, &overrides)?;
            let draft = ManifestDraft {
                model_id,
                quantization,
                sequence_length,
                runtime,
                optimizations,
            };
            emit_manifest(&config, &artifact, &draft, output)?;
            Ok(0)
        }
    }
}

fn kpi_overrides(kpi: KpiArgs) -> ConfigOverrides {
    ConfigOverrides {
        tokenizer: kpi.tokenizer,
        device_budget_mb: kpi.device_budget_mb,
        probe_timeout_ms: kpi.probe_timeout_ms,
        ..ConfigOverrides::default()
    }
}

fn admit(
    config_path: Option<&Path>,
    overrides: &ConfigOverrides,
    stages: StageSet,
    artifact: &Path,
    manifest: Option<&Path>,
) -> Result<AdmissionReport, Box<dyn std::error::Error>> {
    let config = load_config(config_path, overrides)?;
    let pipeline = AdmissionPipeline::new(&config, stages)?;
    Ok(pipeline.run(artifact, manifest)?)
}

fn finish(
    report: &AdmissionReport,
    json_output: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    print!("{}", report.render_plain());
    if let Some(path) = json_output {
        report.write_json(path)?;
        println!("wrote admission_report={}", path.display());
    }
    Ok(())
}

fn emit_manifest(
    config: &AdmissionConfig,
    artifact: &Path,
    draft: &ManifestDraft,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let hasher = Sha256StreamHasher::new(config.integrity.chunk_size)?;
    let manifest = build_manifest(&hasher, artifact, draft)?;
    let path = output.unwrap_or_else(|| {
        artifact
            .parent()
            .map_or_else(|| PathBuf::from(MANIFEST_FILE_NAME), |dir| dir.join(MANIFEST_FILE_NAME))
    });
    write_manifest(&path, &manifest)?;
    println!("wrote manifest={}", path.display());
    if let Some(sha) = manifest.get("sha256").and_then(|value| value.as_str()) {
        println!("  sha256: {sha}");
    }

    let size_bytes = fs::metadata(artifact)?.len();
    let fit = estimate_ram(size_bytes, &config.kpi.device);
    println!(
        "  required RAM: {:.0} MB ({:.1} MB x {} + {:.0} MB)",
        fit.required_ram_mb,
        fit.file_size_mb,
        config.kpi.device.ram_multiplier,
        config.kpi.device.ram_overhead_mb
    );
    match fit.preset {
        Some(preset) => {
            let settings = preset.settings();
            println!(
                "  device fit: fits {:.0} MB budget; preset {} (ctx {}, {} new tokens, top_p {:.2}, temperature {:.2})",
                fit.device_budget_mb,
                preset.as_str(),
                settings.context_length,
                settings.max_new_tokens,
                settings.top_p,
                settings.temperature
            );
        }
        None => println!(
            "  device fit: exceeds {:.0} MB budget by {:.0} MB",
            fit.device_budget_mb, -fit.headroom_mb
        ),
    }
    Ok(())
}
