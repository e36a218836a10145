//! Minimum-of-N sampling.
//!
//! Scheduler preemption, interrupts, and cache misses only ever add latency
//! to a trial, so the minimum over many trials is the estimate closest to
//! the true fault latency.

use crate::rtm::{FaultSuppressedProbe, ProbeBackend, RetryStats};
use drk_common::error::{DrkError, DrkResult};
use drk_common::metrics::TrialStats;
use drk_common::probe::{ProbeResult, ProbeTarget};
use drk_common::time::CycleCount;
use tracing::trace;

/// Repeats fault-suppressed probes and keeps the fastest one.
#[derive(Debug)]
pub struct Sampler<B: ProbeBackend> {
    probe: FaultSuppressedProbe<B>,
}

impl<B: ProbeBackend> Sampler<B> {
    /// Create a sampler around a retrying probe.
    pub fn new(probe: FaultSuppressedProbe<B>) -> Self {
        Self { probe }
    }

    /// Create a sampler directly from a backend and attempt bound.
    ///
    /// # Errors
    ///
    /// Returns an error if `max_attempts` is zero.
    pub fn with_backend(backend: B, max_attempts: u32) -> DrkResult<Self> {
        Ok(Self::new(FaultSuppressedProbe::new(backend, max_attempts)?))
    }

    /// Minimum latency of `target` over `trials` valid samples.
    ///
    /// # Errors
    ///
    /// Returns [`DrkError::Config`] for zero trials, or the first trial's
    /// [`DrkError::RetryExhausted`]; no partial minimum is returned.
    pub fn sample(&mut self, target: ProbeTarget, trials: u32) -> DrkResult<ProbeResult> {
        self.run(target, trials, |_| {})
    }

    /// Like [`Sampler::sample`], also returning the full trial distribution.
    ///
    /// # Errors
    ///
    /// Same as [`Sampler::sample`].
    pub fn sample_with_stats(
        &mut self,
        target: ProbeTarget,
        trials: u32,
    ) -> DrkResult<(ProbeResult, TrialStats)> {
        let mut stats = TrialStats::new(trials as usize);
        let result = self.run(target, trials, |c| stats.record(c))?;
        Ok((result, stats))
    }

    fn run<F: FnMut(CycleCount)>(
        &mut self,
        target: ProbeTarget,
        trials: u32,
        mut observe: F,
    ) -> DrkResult<ProbeResult> {
        if trials == 0 {
            return Err(DrkError::Config("trial count must be > 0".into()));
        }

        let mut min = CycleCount::MAX;
        for _ in 0..trials {
            let cycles = self.probe.execute(target)?;
            observe(cycles);
            min = min.min(cycles);
        }

        trace!(address = target.address, kind = %target.kind, min = %min, trials, "Sampled");
        Ok(ProbeResult {
            target,
            min_cycles: min,
            trials,
        })
    }

    /// Attempt counters of the underlying probe.
    #[must_use]
    pub fn retry_stats(&self) -> RetryStats {
        self.probe.stats()
    }
}
