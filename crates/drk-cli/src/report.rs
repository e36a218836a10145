//! Result output.
//!
//! Scan sweeps go to one text file each; measurements and calibration go to
//! stdout as a single JSON object.

use drk_common::error::DrkError;
use drk_common::metrics::TrialSnapshot;
use drk_common::probe::{ProbeKind, ProbeResult, ScanResult};
use drk_core::rtm::RetryStats;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// File name for one sweep: `<prefix>_<trials>_<repeat>`.
#[must_use]
pub fn scan_output_path(prefix: &Path, trials: u32, repeat: u32) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(format!("_{trials}_{repeat}"));
    PathBuf::from(name)
}

/// Write a sweep as text: the elapsed time header, then one line per
/// address with the minimum of each kind in column order.
///
/// # Errors
///
/// Propagates write failures.
pub fn write_scan<W: Write>(out: &mut W, result: &ScanResult) -> io::Result<()> {
    writeln!(out, "Elapsed Time: {}", result.elapsed.as_micros())?;
    for row in result.rows() {
        write!(out, "{:#x}", row.address)?;
        for min in row.minima() {
            write!(out, " {min}")?;
        }
        writeln!(out)?;
    }
    out.flush()
}

/// Write a sweep to `<prefix>_<trials>_<repeat>` and return the path.
///
/// # Errors
///
/// Returns [`DrkError::Io`] naming the path on any failure.
pub fn write_scan_file(prefix: &Path, trials: u32, result: &ScanResult) -> Result<PathBuf, DrkError> {
    let path = scan_output_path(prefix, trials, result.repeat);
    let io_err = |e: io::Error| DrkError::Io(format!("{}: {e}", path.display()));

    let file = File::create(&path).map_err(io_err)?;
    write_scan(&mut BufWriter::new(file), result).map_err(io_err)?;
    Ok(path)
}

/// Single-address measurement as printed by `measure`.
#[derive(Debug, Serialize)]
pub struct MeasureReport {
    /// Probed address in hex.
    pub address: String,
    /// Probe operation.
    pub kind: ProbeKind,
    /// Fixture class, when measuring a fixture.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixture: Option<String>,
    /// Minimum latency in cycles.
    pub min_cycles: u64,
    /// Trials taken.
    pub iter: u32,
    /// Trial distribution, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<TrialSnapshot>,
    /// Attempt counters.
    pub attempts: RetryStats,
}

impl MeasureReport {
    /// Build a report from a sampled result.
    #[must_use]
    pub fn new(result: &ProbeResult, attempts: RetryStats) -> Self {
        Self {
            address: format!("{:#x}", result.target.address),
            kind: result.target.kind,
            fixture: None,
            min_cycles: result.min_cycles.get(),
            iter: result.trials,
            stats: None,
            attempts,
        }
    }
}

/// Print `value` to stdout as one line of JSON.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    serde_json::to_writer(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}
