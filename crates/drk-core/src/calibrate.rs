//! Built-in calibration run.
//!
//! Measures the known fixtures so a user can see, on the current machine,
//! how far apart the executable, non-executable and unmapped latencies lie
//! before trusting a scan of unknown addresses.

use crate::fixture::FixtureSet;
use crate::rtm::ProbeBackend;
use crate::sampler::Sampler;
use drk_common::error::DrkResult;
use drk_common::probe::{FixtureClass, ProbeKind, ProbeTarget};
use drk_common::time::CycleCount;
use serde::Serialize;
use tracing::info;

/// Minimum latencies of the calibration fixtures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CalibrationReport {
    /// `jmp` to the executable page.
    #[serde(rename = "x_jmp_clk")]
    pub x_jmp: CycleCount,
    /// `jmp` to the non-executable page.
    #[serde(rename = "nx_jmp_clk")]
    pub nx_jmp: CycleCount,
    /// `jmp` to the unmapped address.
    #[serde(rename = "u_jmp_clk")]
    pub u_jmp: CycleCount,
    /// Store to the mapped, read-only page.
    #[serde(rename = "m_write_clk")]
    pub m_write: CycleCount,
    /// Store to the unmapped address.
    #[serde(rename = "u_write_clk")]
    pub u_write: CycleCount,
    /// Invalid-opcode baseline.
    #[serde(rename = "ud_clk")]
    pub ud: CycleCount,
    /// Trials per measurement.
    #[serde(rename = "iter")]
    pub trials: u32,
}

impl CalibrationReport {
    /// Whether both non-executable and unmapped `jmp` latencies exceed the
    /// executable one by more than `margin` cycles.
    #[must_use]
    pub fn separates(&self, margin: u64) -> bool {
        let floor = self.x_jmp.get().saturating_add(margin);
        self.nx_jmp.get() > floor && self.u_jmp.get() > floor
    }
}

/// Measure every fixture with `trials` samples each.
///
/// # Errors
///
/// Returns the first sampling failure.
pub fn calibrate<B: ProbeBackend>(
    sampler: &mut Sampler<B>,
    fixtures: &FixtureSet,
    trials: u32,
) -> DrkResult<CalibrationReport> {
    let mut measure = |class: FixtureClass, kind: ProbeKind| -> DrkResult<CycleCount> {
        let target = ProbeTarget::new(fixtures.get(class).address(), kind);
        Ok(sampler.sample(target, trials)?.min_cycles)
    };

    let x_jmp = measure(FixtureClass::Executable, ProbeKind::Jmp)?;
    let nx_jmp = measure(FixtureClass::NonExecutable, ProbeKind::Jmp)?;
    let m_write = measure(FixtureClass::NonExecutable, ProbeKind::Write)?;
    let u_write = measure(FixtureClass::Unmapped, ProbeKind::Write)?;
    let u_jmp = measure(FixtureClass::Unmapped, ProbeKind::Jmp)?;
    let ud = measure(FixtureClass::Unmapped, ProbeKind::Illegal)?;

    let report = CalibrationReport {
        x_jmp,
        nx_jmp,
        u_jmp,
        m_write,
        u_write,
        ud,
        trials,
    };
    info!(?report, "Calibration complete");
    Ok(report)
}
