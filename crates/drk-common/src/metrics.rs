//! Per-trial statistics for a single probe target.
//!
//! The sampler only needs the minimum, but keeping the trial distribution
//! around makes it possible to see how noisy a target was. Samples live in a
//! fixed ring buffer so recording never allocates.

use crate::time::CycleCount;

/// Trial latency distribution with a ring buffer for percentiles.
#[derive(Debug)]
pub struct TrialStats {
    /// Ring buffer of trial latencies in cycles.
    samples: Box<[u64]>,
    /// Current write position in the ring buffer.
    write_pos: usize,
    /// Number of samples held (saturates at buffer size).
    sample_count: usize,
    /// Total trials recorded.
    total_trials: u64,
    min_cycles: u64,
    max_cycles: u64,
    /// Sum of all trial latencies for mean calculation.
    sum_cycles: u128,
}

impl TrialStats {
    /// Create a collector retaining up to `capacity` trials for percentiles.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let size = capacity.max(1);
        Self {
            samples: vec![0u64; size].into_boxed_slice(),
            write_pos: 0,
            sample_count: 0,
            total_trials: 0,
            min_cycles: u64::MAX,
            max_cycles: 0,
            sum_cycles: 0,
        }
    }

    /// Record one trial latency.
    pub fn record(&mut self, cycles: CycleCount) {
        let c = cycles.get();

        self.samples[self.write_pos] = c;
        self.write_pos = (self.write_pos + 1) % self.samples.len();
        self.sample_count = self.sample_count.saturating_add(1).min(self.samples.len());

        self.total_trials += 1;
        self.min_cycles = self.min_cycles.min(c);
        self.max_cycles = self.max_cycles.max(c);
        self.sum_cycles += u128::from(c);
    }

    /// Total number of trials recorded.
    #[must_use]
    pub fn total_trials(&self) -> u64 {
        self.total_trials
    }

    /// Smallest trial latency.
    #[must_use]
    pub fn min(&self) -> Option<CycleCount> {
        (self.total_trials > 0).then_some(CycleCount(self.min_cycles))
    }

    /// Largest trial latency.
    #[must_use]
    pub fn max(&self) -> Option<CycleCount> {
        (self.total_trials > 0).then_some(CycleCount(self.max_cycles))
    }

    /// Mean trial latency, rounded down.
    #[must_use]
    pub fn mean(&self) -> Option<CycleCount> {
        if self.total_trials == 0 {
            return None;
        }
        let mean = self.sum_cycles / u128::from(self.total_trials);
        Some(CycleCount(u64::try_from(mean).unwrap_or(u64::MAX)))
    }

    /// Compute a percentile (0.0 to 100.0) over the retained trials.
    ///
    /// Returns `None` if no trials have been recorded or if the percentile is
    /// out of range.
    #[must_use]
    pub fn percentile(&self, percentile: f64) -> Option<CycleCount> {
        self.percentiles(&[percentile]).first().map(|&(_, c)| c)
    }

    /// Compute multiple percentiles with a single sort.
    ///
    /// Invalid percentiles (< 0, > 100, or NaN) are skipped.
    #[must_use]
    pub fn percentiles(&self, percentiles: &[f64]) -> Vec<(f64, CycleCount)> {
        if self.sample_count == 0 {
            return vec![];
        }

        let mut sorted: Vec<u64> = self.samples[..self.sample_count].to_vec();
        sorted.sort_unstable();

        percentiles
            .iter()
            .filter(|&&p| (0.0..=100.0).contains(&p))
            .map(|&p| {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
                let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
                let idx = idx.min(sorted.len() - 1);
                (p, CycleCount(sorted[idx]))
            })
            .collect()
    }

    /// Get a snapshot for reporting.
    #[must_use]
    pub fn snapshot(&self) -> TrialSnapshot {
        TrialSnapshot {
            trials: self.total_trials,
            min: self.min(),
            max: self.max(),
            mean: self.mean(),
            median: self.percentile(50.0),
            p99: self.percentile(99.0),
        }
    }
}

/// Immutable summary of a trial distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct TrialSnapshot {
    /// Trials recorded.
    pub trials: u64,
    /// Smallest latency.
    pub min: Option<CycleCount>,
    /// Largest latency.
    pub max: Option<CycleCount>,
    /// Mean latency.
    pub mean: Option<CycleCount>,
    /// 50th percentile.
    pub median: Option<CycleCount>,
    /// 99th percentile.
    pub p99: Option<CycleCount>,
}
