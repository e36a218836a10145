//! DrK probe entry point.
//!
//! Sweeps address ranges, measures single addresses or calibration
//! fixtures, and reports host support, all through fault-suppressed TSX
//! probes.

mod ranges;
mod report;

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use drk_common::config::{BackendKind, CpuAffinity, DrkConfig};
use drk_common::error::DrkResult;
use drk_common::probe::{AddressRange, FixtureClass, ProbeKind, ProbeTarget, ScanResult};
use drk_core::calibrate::calibrate;
use drk_core::fixture::{FixtureSet, MemoryFixture};
use drk_core::hwcaps::{HostCapabilities, KaslrSetting};
use drk_core::realtime::{page_size, prepare_measurement_thread};
use drk_core::rtm::{AttemptOutcome, ProbeBackend, RtmBackend, SimulatedBackend};
use drk_core::sampler::Sampler;
use drk_core::scan::Scanner;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::report::{print_json, write_scan_file, MeasureReport};

/// DrK probe command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "drk-probe",
    about = "Derandomize kernel address space layout with TSX fault timing",
    version,
    long_about = None
)]
struct Args {
    /// Path to a configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info", global = true)]
    log_level: String,

    /// Use the simulated backend instead of RTM.
    #[arg(long, global = true)]
    simulated: bool,

    /// Pin the measuring thread to this CPU.
    #[arg(long, value_name = "N", global = true)]
    cpu: Option<usize>,

    /// Attempts allowed per trial before giving up.
    #[arg(long, value_name = "N", global = true)]
    max_attempts: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sweep the ranges in a file and write one result file per repetition.
    Scan(ScanArgs),
    /// Measure one address or calibration fixture.
    Measure(MeasureArgs),
    /// Measure all calibration fixtures.
    Calibrate {
        /// Trials per fixture.
        #[arg(long, short = 'i', value_name = "TRIALS")]
        iterations: Option<u32>,
    },
    /// Report CPU and kernel support.
    Info,
}

#[derive(ClapArgs, Debug)]
struct ScanArgs {
    /// Range file: base, end, stride in hex, one per line.
    #[arg(long, short = 'f', value_name = "FILE")]
    file: PathBuf,

    /// Output file prefix.
    #[arg(long, short = 'o', value_name = "PREFIX")]
    output: PathBuf,

    /// Number of sweeps.
    #[arg(long, short = 'r', value_name = "N")]
    repeat: Option<u32>,

    /// Trials per address and kind.
    #[arg(long, short = 'i', value_name = "TRIALS")]
    iterations: Option<u32>,

    /// Probe kind per column, in order (repeatable).
    #[arg(long = "kind", short = 'k', value_name = "KIND")]
    kinds: Vec<ProbeKind>,
}

#[derive(ClapArgs, Debug)]
struct MeasureArgs {
    /// Address to probe, in hex.
    #[arg(long, short = 'a', value_parser = parse_address, conflicts_with = "fixture")]
    address: Option<u64>,

    /// Calibration fixture to probe: x, nx or u.
    #[arg(long = "fixture", short = 't', value_name = "CLASS")]
    fixture: Option<FixtureClass>,

    /// Probe operation.
    #[arg(long = "kind", short = 'm', default_value = "jmp")]
    kind: ProbeKind,

    /// Trials to take.
    #[arg(long, short = 'i', value_name = "TRIALS")]
    iterations: Option<u32>,

    /// Include the trial distribution in the output.
    #[arg(long)]
    stats: bool,
}

fn parse_address(text: &str) -> Result<u64, String> {
    ranges::parse_hex(text).ok_or_else(|| format!("{text:?} is not a hexadecimal address"))
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting DrK probe");

    let mut config = load_config(&args)?;
    apply_overrides(&mut config, &args);

    match args.command {
        Command::Info => run_info(),
        Command::Scan(scan) => {
            if let Some(repeat) = scan.repeat {
                config.scan.repeat = repeat;
            }
            if let Some(trials) = scan.iterations {
                config.probe.trial_count = trials;
            }
            if !scan.kinds.is_empty() {
                config.scan.kinds = scan.kinds.clone();
            }
            config.validate()?;
            run_scan(&config, &scan)
        }
        Command::Measure(measure) => {
            if let Some(trials) = measure.iterations {
                config.probe.trial_count = trials;
            }
            config.validate()?;
            run_measure(&config, &measure)
        }
        Command::Calibrate { iterations } => {
            if let Some(trials) = iterations {
                config.probe.trial_count = trials;
            }
            config.validate()?;
            run_calibrate(&config)
        }
    }
}

/// Initialize logging to stderr with the specified log level.
fn init_logging(level: &str) {
    let filter = format!("drk_probe={level},drk_core={level},drk_common={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `DRK_CONFIG_PATH` environment variable
/// 3. `config/default.toml` (local development)
/// 4. Built-in defaults
fn load_config(args: &Args) -> Result<DrkConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return DrkConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {config_path:?}"));
    }

    if let Ok(env_path) = std::env::var("DRK_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from DRK_CONFIG_PATH");
            return DrkConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from DRK_CONFIG_PATH={env_path:?}"));
        }
        warn!(
            path = %env_path,
            "DRK_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    let local_path = PathBuf::from("config/default.toml");
    if local_path.exists() {
        info!(?local_path, "Loading config from local path");
        return DrkConfig::from_file(&local_path)
            .with_context(|| format!("Failed to load config from {local_path:?}"));
    }

    info!("No config file found, using built-in defaults");
    Ok(DrkConfig::default())
}

fn apply_overrides(config: &mut DrkConfig, args: &Args) {
    if args.simulated {
        config.probe.backend = BackendKind::Simulated;
    }
    if let Some(cpu) = args.cpu {
        config.realtime.cpu_affinity = CpuAffinity::Single(cpu);
    }
    if let Some(max_attempts) = args.max_attempts {
        config.probe.max_attempts = max_attempts;
    }
}

/// Backend selected at runtime.
enum Backend {
    Rtm(RtmBackend),
    Simulated(SimulatedBackend),
}

impl ProbeBackend for Backend {
    #[inline]
    fn attempt(&mut self, target: ProbeTarget) -> AttemptOutcome {
        match self {
            Backend::Rtm(backend) => backend.attempt(target),
            Backend::Simulated(backend) => backend.attempt(target),
        }
    }
}

/// Create the configured backend. The simulated backend treats the given
/// fixtures as mapped so calibration output has a realistic shape.
fn create_backend(config: &DrkConfig, fixtures: &[&MemoryFixture]) -> Result<Backend> {
    match config.probe.backend {
        BackendKind::Rtm => {
            let backend = RtmBackend::new().context("RTM backend unavailable (try --simulated)")?;
            info!("Using RTM backend");
            Ok(Backend::Rtm(backend))
        }
        BackendKind::Simulated => {
            warn!("Using simulated backend; cycle counts are synthetic");
            let page = page_size() as u64;
            let backend = fixtures.iter().fold(SimulatedBackend::default(), |sim, fixture| {
                match fixture.class() {
                    FixtureClass::Executable => sim.with_executable(fixture.address(), page),
                    FixtureClass::NonExecutable => sim.with_mapped(fixture.address(), page),
                    FixtureClass::Unmapped => sim,
                }
            });
            Ok(Backend::Simulated(backend))
        }
    }
}

fn create_sampler(config: &DrkConfig, fixtures: &[&MemoryFixture]) -> Result<Sampler<Backend>> {
    let backend = create_backend(config, fixtures)?;
    prepare_measurement_thread(&config.realtime).context("Failed to prepare measuring thread")?;
    Ok(Sampler::with_backend(backend, config.probe.max_attempts)?)
}

fn run_scan(config: &DrkConfig, args: &ScanArgs) -> Result<()> {
    let parsed = ranges::read_range_file(&args.file)?;
    match &parsed.stop {
        Some(reason) if reason.is_terminator() => {
            info!(ranges = parsed.ranges.len(), %reason, "Range list terminated");
        }
        Some(reason) => {
            warn!(ranges = parsed.ranges.len(), %reason, "Stopped reading range file early");
        }
        None => info!(ranges = parsed.ranges.len(), "Range file read"),
    }
    if parsed.ranges.is_empty() {
        bail!("no valid ranges in {}", args.file.display());
    }

    let sampler = create_sampler(config, &[])?;
    let mut scanner = Scanner::from_config(sampler, &config.scan)?;
    let trials = config.probe.trial_count;

    let (sweeps, written) =
        write_sweeps(&mut scanner, &parsed.ranges, trials, config.scan.repeat, |result| {
            write_scan_file(&args.output, trials, result)
        })?;

    let stats = scanner.sampler().retry_stats();
    info!(
        sweeps,
        written,
        attempts = stats.attempts,
        spurious = stats.spurious,
        commits = stats.commits,
        "Scan complete"
    );
    Ok(())
}

/// Run `repeats` sweeps, handing each to `write` as it completes.
///
/// A failed write is logged and the remaining sweeps still run. Returns the
/// number of sweeps completed and the number written.
fn write_sweeps<B, W>(
    scanner: &mut Scanner<B>,
    ranges: &[AddressRange],
    trials: u32,
    repeats: u32,
    mut write: W,
) -> DrkResult<(u32, u32)>
where
    B: ProbeBackend,
    W: FnMut(&ScanResult) -> DrkResult<PathBuf>,
{
    let mut written = 0u32;
    let sweeps = scanner.repeat(ranges, trials, repeats, |result| match write(&result) {
        Ok(path) => {
            written += 1;
            info!(path = %path.display(), rows = result.len(), "Sweep written");
        }
        Err(e) => error!(repeat = result.repeat, error = %e, "Failed to write sweep, continuing"),
    })?;
    Ok((sweeps, written))
}

fn run_measure(config: &DrkConfig, args: &MeasureArgs) -> Result<()> {
    let fixture = args
        .fixture
        .map(|class| MemoryFixture::provision(class, config.calibration.unmapped_address))
        .transpose()?;

    let address = match (&fixture, args.address) {
        (Some(fixture), _) => fixture.address(),
        (None, Some(address)) => address,
        (None, None) => bail!("measure needs either --address or --fixture"),
    };

    if fixture.is_none() && !args.kind.uses_target() {
        warn!(kind = %args.kind, "Probe kind ignores the address; measuring its fixed baseline");
    }

    let fixtures: Vec<&MemoryFixture> = fixture.iter().collect();
    let mut sampler = create_sampler(config, &fixtures)?;
    let target = ProbeTarget::new(address, args.kind);
    let trials = config.probe.trial_count;

    let mut report = if args.stats {
        let (result, stats) = sampler.sample_with_stats(target, trials)?;
        let mut report = MeasureReport::new(&result, sampler.retry_stats());
        report.stats = Some(stats.snapshot());
        report
    } else {
        let result = sampler.sample(target, trials)?;
        MeasureReport::new(&result, sampler.retry_stats())
    };
    report.fixture = args.fixture.map(|class| class.to_string());

    print_json(&report)
}

fn run_calibrate(config: &DrkConfig) -> Result<()> {
    let mut trials = config.probe.trial_count;
    if trials < config.calibration.min_trials {
        warn!(
            requested = trials,
            min = config.calibration.min_trials,
            "Trial count raised to the calibration minimum"
        );
        trials = config.calibration.min_trials;
    }

    let fixtures = FixtureSet::provision_all(config.calibration.unmapped_address)?;
    let mut sampler = create_sampler(
        config,
        &[&fixtures.executable, &fixtures.non_executable, &fixtures.unmapped],
    )?;

    let report = calibrate(&mut sampler, &fixtures, trials)?;
    print_json(&report)
}

#[derive(Serialize)]
struct InfoReport {
    #[serde(flatten)]
    host: HostCapabilities,
    probing_supported: bool,
}

fn run_info() -> Result<()> {
    let host = HostCapabilities::detect();
    let probing_supported = match host.require_probing() {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Probing cannot run on this host");
            false
        }
    };
    if host.kaslr_cmdline == Some(KaslrSetting::Disabled) {
        warn!("Kernel booted with nokaslr; there is nothing to derandomize");
    }

    print_json(&InfoReport {
        host,
        probing_supported,
    })
}
