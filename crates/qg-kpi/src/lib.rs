#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::env;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use qg_types::{KpiMetric, KpiSample, KpiValue, Threshold, bytes_to_mib};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 30_000;
pub const MANAGED_MEMORY_LABEL: &str =
    "process-managed allocations only; excludes native/foreign runtime allocations";
/// Extra wait past the probe timeout before the worker is abandoned, so a
/// runtime that enforces the timeout itself gets to report it.
pub const DEADLINE_GRACE: Duration = Duration::from_millis(250);
const RUNNER_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum KpiError {
    #[error("inference runtime is not available")]
    RuntimeUnavailable,
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed waiting on {program}: {source}")]
    Wait {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{program} timed out after {timeout_ms} ms and was killed")]
    TimedOut { program: PathBuf, timeout_ms: u128 },
    #[error("{program} exited with status {status}: {stderr}")]
    RunnerFailed {
        program: PathBuf,
        status: i32,
        stderr: String,
    },
    #[error("runner output is missing `{0}`")]
    MissingField(&'static str),
    #[error("runner output field `{key}` is not a number: {value:?}")]
    InvalidField { key: String, value: String },
}

// ── Thresholds ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KpiThresholds {
    pub ttft_ms: f64,
    pub tok_s: f64,
    pub mem_peak_mb: f64,
}

impl Default for KpiThresholds {
    fn default() -> Self {
        Self {
            ttft_ms: 350.0,
            tok_s: 10.0,
            mem_peak_mb: 3500.0,
        }
    }
}

impl KpiThresholds {
    #[must_use]
    pub const fn threshold(&self, metric: KpiMetric) -> Threshold {
        match metric {
            KpiMetric::TtftMs => Threshold::at_most(self.ttft_ms),
            KpiMetric::TokS => Threshold::at_least(self.tok_s),
            KpiMetric::MemPeakMb => Threshold::at_most(self.mem_peak_mb),
        }
    }
}

// ── Runtime capability ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    pub elapsed_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BenchReport {
    pub tokens: u64,
    pub elapsed_ms: f64,
    pub ttft_ms: Option<f64>,
    /// Native peak as measured by the runner itself.
    pub mem_peak_mb: Option<f64>,
}

impl BenchReport {
    #[must_use]
    pub fn tokens_per_second(&self) -> Option<f64> {
        (self.elapsed_ms > 0.0).then(|| self.tokens as f64 * 1000.0 / self.elapsed_ms)
    }
}

/// Something that can load and run an exported artifact. Callers must ask
/// `probe_available` first; nothing here is assumed to exist.
///
/// `timeout` is the probe's budget. Implementations that start external work
/// must stop it once the budget is spent; the evaluator abandons the call
/// shortly after.
pub trait InferenceRuntime: Send + Sync {
    fn name(&self) -> &str;

    fn probe_available(&self) -> bool;

    fn load(&self, artifact: &Path, timeout: Duration) -> Result<LoadReport, KpiError>;

    fn bench(
        &self,
        artifact: &Path,
        tokenizer: &Path,
        timeout: Duration,
    ) -> Result<BenchReport, KpiError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoRuntime;

impl InferenceRuntime for NoRuntime {
    fn name(&self) -> &str {
        "none"
    }

    fn probe_available(&self) -> bool {
        false
    }

    fn load(&self, _artifact: &Path, _timeout: Duration) -> Result<LoadReport, KpiError> {
        Err(KpiError::RuntimeUnavailable)
    }

    fn bench(
        &self,
        _artifact: &Path,
        _tokenizer: &Path,
        _timeout: Duration,
    ) -> Result<BenchReport, KpiError> {
        Err(KpiError::RuntimeUnavailable)
    }
}

/// External runner invocation. `{artifact}` and `{tokenizer}` in the argument
/// lists are replaced before launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub load_args: Vec<String>,
    #[serde(default)]
    pub bench_args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CommandRuntime {
    command: RuntimeCommand,
    resolved: Option<PathBuf>,
}

impl CommandRuntime {
    #[must_use]
    pub fn new(command: RuntimeCommand) -> Self {
        let resolved = resolve_program(&command.program);
        Self { command, resolved }
    }

    /// Runs the runner to completion or until `timeout`, whichever is first.
    /// A runner still alive at the deadline is killed and reaped.
    fn run(&self, args: &[String], timeout: Duration) -> Result<String, KpiError> {
        let program = self.resolved.as_ref().ok_or(KpiError::RuntimeUnavailable)?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| KpiError::Spawn {
                program: program.clone(),
                source,
            })?;
        // Drained on their own threads so a chatty runner cannot block on a
        // full pipe while we poll.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = wait_until(&mut child, timeout).map_err(|source| KpiError::Wait {
            program: program.clone(),
            source,
        })?;
        let Some(status) = status else {
            #[cfg(feature = "tracing")]
            tracing::warn!(program = %program.display(), "runner killed at probe deadline");
            return Err(KpiError::TimedOut {
                program: program.clone(),
                timeout_ms: timeout.as_millis(),
            });
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        if !status.success() {
            return Err(KpiError::RunnerFailed {
                program: program.clone(),
                status: status.code().unwrap_or(-1),
                stderr: stderr.trim().to_owned(),
            });
        }
        Ok(stdout)
    }
}

/// Polls `child` until it exits or `timeout` elapses. `None` means it was
/// killed at the deadline.
fn wait_until(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(Some(status)),
            Ok(None) if started.elapsed() >= timeout => {
                let _ = child.kill();
                child.wait()?;
                return Ok(None);
            }
            Ok(None) => thread::sleep(RUNNER_POLL),
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err);
            }
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut bytes = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut bytes);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    })
}

impl InferenceRuntime for CommandRuntime {
    fn name(&self) -> &str {
        self.command
            .program
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("runner")
    }

    fn probe_available(&self) -> bool {
        self.resolved.is_some()
    }

    fn load(&self, artifact: &Path, timeout: Duration) -> Result<LoadReport, KpiError> {
        let args = substitute_args(&self.command.load_args, artifact, None);
        let started = Instant::now();
        self.run(&args, timeout)?;
        Ok(LoadReport {
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
        })
    }

    fn bench(
        &self,
        artifact: &Path,
        tokenizer: &Path,
        timeout: Duration,
    ) -> Result<BenchReport, KpiError> {
        let args = substitute_args(&self.command.bench_args, artifact, Some(tokenizer));
        let stdout = self.run(&args, timeout)?;
        parse_bench_output(&stdout)
    }
}

/// Absolute or relative paths must exist; bare names are searched on `PATH`.
#[must_use]
pub fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.is_absolute() || program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

#[must_use]
pub fn substitute_args(args: &[String], artifact: &Path, tokenizer: Option<&Path>) -> Vec<String> {
    let artifact = artifact.display().to_string();
    let tokenizer = tokenizer.map(|path| path.display().to_string()).unwrap_or_default();
    args.iter()
        .map(|arg| {
            arg.replace("{artifact}", &artifact)
                .replace("{tokenizer}", &tokenizer)
        })
        .collect()
}

/// Parses whitespace-separated `key=value` pairs. `tokens` and `elapsed_ms`
/// are required; unknown keys are ignored.
pub fn parse_bench_output(stdout: &str) -> Result<BenchReport, KpiError> {
    let fields: BTreeMap<&str, &str> = stdout
        .split_whitespace()
        .filter_map(|pair| pair.split_once('='))
        .collect();

    let number = |key: &str| -> Result<Option<f64>, KpiError> {
        fields
            .get(key)
            .map(|value| {
                value.parse::<f64>().map_err(|_| KpiError::InvalidField {
                    key: key.to_owned(),
                    value: (*value).to_owned(),
                })
            })
            .transpose()
    };

    let tokens = match fields.get("tokens") {
        Some(value) => value.parse::<u64>().map_err(|_| KpiError::InvalidField {
            key: "tokens".to_owned(),
            value: (*value).to_owned(),
        })?,
        None => return Err(KpiError::MissingField("tokens")),
    };
    let elapsed_ms = number("elapsed_ms")?.ok_or(KpiError::MissingField("elapsed_ms"))?;

    Ok(BenchReport {
        tokens,
        elapsed_ms,
        ttft_ms: number("ttft_ms")?,
        mem_peak_mb: number("mem_peak_mb")?,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tokenizer {
    path: Option<PathBuf>,
}

impl Tokenizer {
    #[must_use]
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn probe_available(&self) -> bool {
        self.path.as_deref().is_some_and(Path::is_file)
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Runs `probe` on a worker thread. `None` on timeout or if the worker dies;
/// a timed-out worker is abandoned, not joined.
pub fn run_with_timeout<T, F>(timeout: Duration, probe: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("qg-kpi-probe".to_owned())
        .spawn(move || {
            let _ = tx.send(probe());
        })
        .ok()?;
    rx.recv_timeout(timeout).ok()
}

// ── Memory evidence ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedMemoryEvidence {
    pub peak_rss_mb: f64,
    pub label: String,
}

/// Peak resident set of this process (Linux `VmHWM`). Never stands in for a
/// native measurement.
#[must_use]
pub fn managed_memory_evidence() -> Option<ManagedMemoryEvidence> {
    read_peak_rss_kib().map(|kib| ManagedMemoryEvidence {
        peak_rss_mb: kib as f64 / 1024.0,
        label: MANAGED_MEMORY_LABEL.to_owned(),
    })
}

#[cfg(target_os = "linux")]
fn read_peak_rss_kib() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_status_kib(&status, "VmHWM:")
}

#[cfg(not(target_os = "linux"))]
fn read_peak_rss_kib() -> Option<u64> {
    None
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_status_kib(status: &str, field: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix(field))
        .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse().ok())
}

// ── Evaluation ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KpiConfig {
    pub thresholds: KpiThresholds,
    pub probe_timeout_ms: u64,
    pub tokenizer: Option<PathBuf>,
    pub runtime: Option<RuntimeCommand>,
    pub device: DeviceFitConfig,
}

impl Default for KpiConfig {
    fn default() -> Self {
        Self {
            thresholds: KpiThresholds::default(),
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            tokenizer: None,
            runtime: None,
            device: DeviceFitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiOutcome {
    pub runtime: String,
    pub runtime_available: bool,
    pub tokenizer_available: bool,
    pub samples: Vec<KpiSample>,
}

type ProbeResult<T> = Result<T, String>;

#[derive(Clone)]
pub struct KpiEvaluator {
    runtime: Arc<dyn InferenceRuntime>,
    tokenizer: Tokenizer,
    thresholds: KpiThresholds,
    timeout: Duration,
}

impl KpiEvaluator {
    #[must_use]
    pub fn new(
        runtime: Arc<dyn InferenceRuntime>,
        tokenizer: Tokenizer,
        thresholds: KpiThresholds,
        timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            tokenizer,
            thresholds,
            timeout,
        }
    }

    #[must_use]
    pub fn from_config(config: &KpiConfig) -> Self {
        let runtime: Arc<dyn InferenceRuntime> = match &config.runtime {
            Some(command) => Arc::new(CommandRuntime::new(command.clone())),
            None => Arc::new(NoRuntime),
        };
        Self::new(
            runtime,
            Tokenizer::new(config.tokenizer.clone()),
            config.thresholds,
            Duration::from_millis(config.probe_timeout_ms),
        )
    }

    /// Runs the load and bench probes that the available capabilities allow
    /// and scores all three metrics. Never fails; missing data is `Unmeasured`.
    #[must_use]
    pub fn evaluate(&self, artifact: &Path) -> KpiOutcome {
        let runtime_available = self.runtime.probe_available();
        let tokenizer_available = self.tokenizer.probe_available();

        let load = runtime_available.then(|| {
            let runtime = Arc::clone(&self.runtime);
            let artifact = artifact.to_path_buf();
            self.timed("load", move |timeout| runtime.load(&artifact, timeout))
        });

        let bench = match (runtime_available, self.tokenizer.path()) {
            (true, Some(tokenizer)) if tokenizer_available => {
                let runtime = Arc::clone(&self.runtime);
                let artifact = artifact.to_path_buf();
                let tokenizer = tokenizer.to_path_buf();
                Some(self.timed("bench", move |timeout| {
                    runtime.bench(&artifact, &tokenizer, timeout)
                }))
            }
            _ => None,
        };

        let samples = vec![
            self.ttft_sample(load.as_ref(), bench.as_ref()),
            self.tok_s_sample(runtime_available, bench.as_ref()),
            self.memory_sample(bench.as_ref()),
        ];

        #[cfg(feature = "tracing")]
        {
            for sample in &samples {
                tracing::debug!(metric = %sample.metric, gate = ?sample.gate, "kpi scored");
            }
            // Varies run to run, so it is logged and kept out of the report.
            if let Some(evidence) = managed_memory_evidence() {
                tracing::info!(
                    peak_rss_mb = evidence.peak_rss_mb,
                    label = %evidence.label,
                    "process peak memory"
                );
            }
        }

        KpiOutcome {
            runtime: self.runtime.name().to_owned(),
            runtime_available,
            tokenizer_available,
            samples,
        }
    }

    fn timed<T, F>(&self, label: &str, probe: F) -> ProbeResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Duration) -> Result<T, KpiError> + Send + 'static,
    {
        let timeout = self.timeout;
        let deadline = timeout.saturating_add(DEADLINE_GRACE);
        match run_with_timeout(deadline, move || probe(timeout)) {
            Some(Ok(value)) => Ok(value),
            Some(Err(err)) => Err(format!("{label} probe failed: {err}")),
            None => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    probe = label,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "probe abandoned"
                );
                Err(format!(
                    "{label} probe timed out after {} ms",
                    self.timeout.as_millis()
                ))
            }
        }
    }

    fn score(&self, metric: KpiMetric, value: KpiValue) -> KpiSample {
        KpiSample::score(metric, value, self.thresholds.threshold(metric))
    }

    fn ttft_sample(
        &self,
        load: Option<&ProbeResult<LoadReport>>,
        bench: Option<&ProbeResult<BenchReport>>,
    ) -> KpiSample {
        if let Some(Ok(BenchReport {
            ttft_ms: Some(ttft),
            ..
        })) = bench
        {
            return self
                .score(KpiMetric::TtftMs, KpiValue::Measured(*ttft))
                .with_note("runner-reported time to first token");
        }
        match load {
            Some(Ok(report)) => self
                .score(KpiMetric::TtftMs, KpiValue::Measured(report.elapsed_ms))
                .with_note("artifact load time used as TTFT proxy"),
            Some(Err(reason)) => self.score(KpiMetric::TtftMs, KpiValue::unmeasured(reason.clone())),
            None => self.score(
                KpiMetric::TtftMs,
                KpiValue::unmeasured("inference runtime unavailable"),
            ),
        }
    }

    fn tok_s_sample(
        &self,
        runtime_available: bool,
        bench: Option<&ProbeResult<BenchReport>>,
    ) -> KpiSample {
        let value = match bench {
            _ if !runtime_available => KpiValue::unmeasured("inference runtime unavailable"),
            None => KpiValue::unmeasured("tokenizer unavailable"),
            Some(Ok(report)) => report.tokens_per_second().map_or_else(
                || KpiValue::unmeasured("runner reported zero elapsed time"),
                KpiValue::Measured,
            ),
            Some(Err(reason)) => KpiValue::unmeasured(reason.clone()),
        };
        self.score(KpiMetric::TokS, value)
    }

    fn memory_sample(&self, bench: Option<&ProbeResult<BenchReport>>) -> KpiSample {
        if let Some(Ok(BenchReport {
            mem_peak_mb: Some(peak),
            ..
        })) = bench
        {
            return self
                .score(KpiMetric::MemPeakMb, KpiValue::Measured(*peak))
                .with_note("runner-reported native peak");
        }
        self.score(
            KpiMetric::MemPeakMb,
            KpiValue::unmeasured("native memory profiling unavailable"),
        )
        .with_note(format!(
            "process peak memory is logged, never gated ({MANAGED_MEMORY_LABEL})"
        ))
    }
}

// ── Device fit ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceFitConfig {
    pub budget_mb: f64,
    pub ram_multiplier: f64,
    pub ram_overhead_mb: f64,
}

impl Default for DeviceFitConfig {
    fn default() -> Self {
        Self {
            budget_mb: 6144.0,
            ram_multiplier: 1.6,
            ram_overhead_mb: 600.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimePreset {
    Full,
    Safe,
    Guard,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PresetSettings {
    pub context_length: u32,
    pub max_new_tokens: u32,
    pub top_p: f64,
    pub temperature: f64,
}

impl RuntimePreset {
    /// Picks a preset from the device budget and the headroom left after the
    /// estimated load. On-device admission tiers by the RAM the OS reports as
    /// available at launch; that number does not exist at build time, so the
    /// post-load headroom stands in for it.
    #[must_use]
    pub fn select(budget_mb: f64, headroom_mb: f64) -> Self {
        if budget_mb >= 8192.0 && headroom_mb >= 4000.0 {
            Self::Full
        } else if budget_mb >= 6144.0 && headroom_mb >= 2500.0 {
            Self::Safe
        } else {
            Self::Guard
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Safe => "safe",
            Self::Guard => "guard",
        }
    }

    #[must_use]
    pub const fn settings(self) -> PresetSettings {
        match self {
            Self::Full => PresetSettings {
                context_length: 1024,
                max_new_tokens: 256,
                top_p: 0.95,
                temperature: 0.70,
            },
            Self::Safe => PresetSettings {
                context_length: 512,
                max_new_tokens: 128,
                top_p: 0.90,
                temperature: 0.65,
            },
            Self::Guard => PresetSettings {
                context_length: 384,
                max_new_tokens: 96,
                top_p: 0.85,
                temperature: 0.60,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RamEstimate {
    pub file_size_mb: f64,
    pub required_ram_mb: f64,
    pub device_budget_mb: f64,
    pub headroom_mb: f64,
    pub fits: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<RuntimePreset>,
}

/// `required = size_mb * multiplier + overhead`, compared to the budget.
#[must_use]
pub fn estimate_ram(size_bytes: u64, config: &DeviceFitConfig) -> RamEstimate {
    let file_size_mb = bytes_to_mib(size_bytes);
    let required_ram_mb = file_size_mb * config.ram_multiplier + config.ram_overhead_mb;
    let headroom_mb = config.budget_mb - required_ram_mb;
    let fits = required_ram_mb <= config.budget_mb;
    RamEstimate {
        file_size_mb,
        required_ram_mb,
        device_budget_mb: config.budget_mb,
        headroom_mb,
        fits,
        preset: fits.then(|| RuntimePreset::select(config.budget_mb, headroom_mb)),
    }
}
