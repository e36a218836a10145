//! Address-range sweeps.
//!
//! Every address of every range is sampled once per configured kind, and the
//! results are appended in probe order. The scanner briefly gives up the CPU
//! at the start of each range and then every few addresses, so a pending
//! reschedule lands between samples rather than in the middle of one.

use crate::rtm::ProbeBackend;
use crate::sampler::Sampler;
use drk_common::config::ScanConfig;
use drk_common::error::{DrkError, DrkResult};
use drk_common::probe::{AddressRange, ProbeKind, ProbeTarget, ScanResult, ScanRow};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// When the scanner voluntarily yields the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YieldPolicy {
    /// Yield on every address while the per-range counter is below this.
    pub warmup: u32,
    /// Afterwards, yield when the counter is a multiple of this.
    pub every: u32,
    /// Pause length; zero yields with `sched_yield`.
    pub pause: Duration,
}

impl Default for YieldPolicy {
    fn default() -> Self {
        Self {
            warmup: 10,
            every: 16,
            pause: Duration::ZERO,
        }
    }
}

impl YieldPolicy {
    /// Whether to yield before the `position`-th address (1-based) of a range.
    #[must_use]
    pub fn should_yield(&self, position: u64) -> bool {
        position < u64::from(self.warmup)
            || (self.every > 0 && position % u64::from(self.every) == 0)
    }

    fn pause(&self) {
        if self.pause.is_zero() {
            std::thread::yield_now();
        } else {
            std::thread::sleep(self.pause);
        }
    }
}

/// Sweeps address ranges with a fixed set of probe kinds.
#[derive(Debug)]
pub struct Scanner<B: ProbeBackend> {
    sampler: Sampler<B>,
    kinds: Vec<ProbeKind>,
    yield_policy: YieldPolicy,
}

impl<B: ProbeBackend> Scanner<B> {
    /// Create a scanner sampling `kinds` for every address, in that order.
    ///
    /// # Errors
    ///
    /// Returns [`DrkError::Config`] if `kinds` is empty.
    pub fn new(sampler: Sampler<B>, kinds: Vec<ProbeKind>) -> DrkResult<Self> {
        if kinds.is_empty() {
            return Err(DrkError::Config("scanner needs at least one probe kind".into()));
        }
        Ok(Self {
            sampler,
            kinds,
            yield_policy: YieldPolicy::default(),
        })
    }

    /// Create a scanner from the `[scan]` configuration section.
    ///
    /// # Errors
    ///
    /// Returns [`DrkError::Config`] if the configured kind list is empty.
    pub fn from_config(sampler: Sampler<B>, config: &ScanConfig) -> DrkResult<Self> {
        Ok(Self::new(sampler, config.kinds.clone())?.with_yield_policy(YieldPolicy {
            warmup: config.yield_warmup,
            every: config.yield_every,
            pause: config.yield_pause,
        }))
    }

    /// Replace the yield policy.
    #[must_use]
    pub fn with_yield_policy(mut self, policy: YieldPolicy) -> Self {
        self.yield_policy = policy;
        self
    }

    /// Kinds sampled per address.
    #[must_use]
    pub fn kinds(&self) -> &[ProbeKind] {
        &self.kinds
    }

    /// Access the sampler, e.g. for its retry counters.
    pub fn sampler(&self) -> &Sampler<B> {
        &self.sampler
    }

    /// Run one sweep over `ranges`.
    ///
    /// # Errors
    ///
    /// Returns [`DrkError::Config`] for zero trials, or the first sampling
    /// failure; the partial sweep is discarded.
    pub fn scan(&mut self, ranges: &[AddressRange], trials: u32) -> DrkResult<ScanResult> {
        self.sweep(0, ranges, trials)
    }

    /// Run `repeats` independent sweeps, handing each result to `sink` as
    /// soon as it completes.
    ///
    /// Returns the number of sweeps completed.
    ///
    /// # Errors
    ///
    /// Returns the first sweep failure; sweeps already delivered stay delivered.
    pub fn repeat<F>(
        &mut self,
        ranges: &[AddressRange],
        trials: u32,
        repeats: u32,
        mut sink: F,
    ) -> DrkResult<u32>
    where
        F: FnMut(ScanResult),
    {
        for index in 0..repeats {
            let result = self.sweep(index, ranges, trials)?;
            sink(result);
        }
        Ok(repeats)
    }

    fn sweep(&mut self, repeat: u32, ranges: &[AddressRange], trials: u32) -> DrkResult<ScanResult> {
        if trials == 0 {
            return Err(DrkError::Config("trial count must be > 0".into()));
        }

        let total = total_addresses(ranges);
        info!(
            repeat,
            ranges = ranges.len(),
            addresses = total,
            trials,
            kinds = ?self.kinds,
            "Starting sweep"
        );

        let started = Instant::now();
        let mut result = ScanResult::new(repeat, self.kinds.clone());

        for range in ranges {
            debug!(%range, addresses = range.len(), "Scanning range");
            for (position, address) in (1u64..).zip(range.addresses()) {
                if self.yield_policy.should_yield(position) {
                    self.yield_policy.pause();
                    result.yields += 1;
                }
                let row = self.sample_row(address, trials)?;
                result.push_row(row)?;
            }
        }

        result.elapsed = started.elapsed();
        info!(
            repeat,
            rows = result.len(),
            elapsed_us = result.elapsed.as_micros(),
            yields = result.yields,
            "Sweep complete"
        );
        Ok(result)
    }

    fn sample_row(&mut self, address: u64, trials: u32) -> DrkResult<ScanRow> {
        let mut results = Vec::with_capacity(self.kinds.len());
        for &kind in &self.kinds {
            results.push(self.sampler.sample(ProbeTarget::new(address, kind), trials)?);
        }
        Ok(ScanRow { address, results })
    }
}

/// Addresses covered by `ranges`, saturating at `u64::MAX`.
fn total_addresses(ranges: &[AddressRange]) -> u64 {
    ranges.iter().map(AddressRange::len).fold(0, u64::saturating_add)
}
