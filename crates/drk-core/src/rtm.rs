//! Fault-suppressed probing with bounded retries.
//!
//! A [`ProbeBackend`] performs exactly one attempt: open a transaction, run
//! the probe operation, and report how the transaction ended. The
//! [`FaultSuppressedProbe`] retries attempts until one aborts because of the
//! probe's own fault, which is the only outcome that carries a timing signal.
//!
//! # Abort classification
//!
//! - status `0`: the probe faulted (page fault, #GP, #UD). Valid sample.
//! - any other status: explicit abort, conflict, capacity, nested limit,
//!   debug, or an interrupt. Discarded and retried.
//! - commit: the operation did not fault. No signal, retried.

use crate::timing;
use drk_common::error::{DrkError, DrkResult};
use drk_common::probe::{ProbeKind, ProbeTarget};
use drk_common::time::CycleCount;
use std::fmt;
use tracing::{debug, trace, warn};

/// Raw RTM abort status as delivered in `eax`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AbortStatus(pub u32);

impl AbortStatus {
    /// Abort caused by `xabort`.
    pub const EXPLICIT: u32 = 1 << 0;
    /// The transaction may succeed on retry.
    pub const RETRY: u32 = 1 << 1;
    /// Another logical processor conflicted with a transactional access.
    pub const CONFLICT: u32 = 1 << 2;
    /// An internal buffer overflowed.
    pub const CAPACITY: u32 = 1 << 3;
    /// A debug breakpoint was hit.
    pub const DEBUG: u32 = 1 << 4;
    /// The abort happened in a nested transaction.
    pub const NESTED: u32 = 1 << 5;

    /// Whether this abort was raised by the probed operation itself.
    ///
    /// Faults and exceptions inside the region abort with no status bits set.
    #[must_use]
    pub fn is_probe_fault(self) -> bool {
        self.0 == 0
    }

    /// Argument of `xabort`, when the abort was explicit.
    #[must_use]
    pub fn explicit_code(self) -> Option<u8> {
        // Bits 31:24 carry the xabort immediate
        (self.0 & Self::EXPLICIT != 0).then(|| (self.0 >> 24) as u8)
    }

    /// Short name of the dominant abort cause.
    #[must_use]
    pub fn cause(self) -> &'static str {
        let bits = self.0;
        if bits == 0 {
            "fault"
        } else if bits & Self::EXPLICIT != 0 {
            "explicit"
        } else if bits & Self::CONFLICT != 0 {
            "conflict"
        } else if bits & Self::CAPACITY != 0 {
            "capacity"
        } else if bits & Self::DEBUG != 0 {
            "debug"
        } else if bits & Self::NESTED != 0 {
            "nested"
        } else if bits & Self::RETRY != 0 {
            "retry"
        } else {
            "unknown"
        }
    }
}

impl fmt::Display for AbortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.explicit_code() {
            Some(code) => write!(f, "{:#010x} (explicit {code:#04x})", self.0),
            None => write!(f, "{:#010x} ({})", self.0, self.cause()),
        }
    }
}

/// How one transactional attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The probe faulted and the region aborted; elapsed cycles attached.
    Faulted(CycleCount),
    /// The region aborted for an unrelated reason.
    SpuriousAbort(AbortStatus),
    /// The region committed; the operation did not fault.
    Committed,
}

impl AttemptOutcome {
    /// Classify the raw `eax` value left by a transactional region.
    #[must_use]
    pub fn from_status(status: u32, elapsed: CycleCount) -> Self {
        if status == crate::ops::XBEGIN_STARTED {
            return AttemptOutcome::Committed;
        }
        let status = AbortStatus(status);
        if status.is_probe_fault() {
            AttemptOutcome::Faulted(elapsed)
        } else {
            AttemptOutcome::SpuriousAbort(status)
        }
    }
}

/// One transactional attempt against a target.
///
/// Implementations must never let a probe fault reach the OS.
pub trait ProbeBackend {
    /// Run a single attempt.
    fn attempt(&mut self, target: ProbeTarget) -> AttemptOutcome;
}

impl<F> ProbeBackend for F
where
    F: FnMut(ProbeTarget) -> AttemptOutcome,
{
    fn attempt(&mut self, target: ProbeTarget) -> AttemptOutcome {
        self(target)
    }
}

/// Hardware RTM backend.
///
/// Construction checks CPUID, so holding one proves `xbegin` and `rdtscp`
/// are safe to execute on this host.
#[derive(Debug)]
pub struct RtmBackend {
    _private: (),
}

impl RtmBackend {
    /// Create the backend after verifying the host supports RTM and RDTSCP.
    ///
    /// # Errors
    ///
    /// Returns [`DrkError::HardwareUnsupported`] otherwise.
    pub fn new() -> DrkResult<Self> {
        crate::hwcaps::HostCapabilities::detect().require_probing()?;
        Ok(Self { _private: () })
    }
}

impl ProbeBackend for RtmBackend {
    #[cfg(target_arch = "x86_64")]
    #[inline]
    fn attempt(&mut self, target: ProbeTarget) -> AttemptOutcome {
        let start = timing::begin();
        // SAFETY: `new` verified RTM support; the probe runs inside the
        // transaction and any fault aborts it instead of reaching the OS.
        let status = unsafe { crate::ops::transact(target.kind, target.address) };
        let stop = timing::end();

        AttemptOutcome::from_status(status, stop.since(start))
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn attempt(&mut self, _target: ProbeTarget) -> AttemptOutcome {
        // Unreachable: `new` refuses non-x86_64 hosts.
        AttemptOutcome::Committed
    }
}

/// Deterministic stand-in for hosts without TSX.
///
/// Latencies follow the shape observed on real hardware: executable targets
/// fault fastest under `jmp`/`call`, mapped pages fault faster than unmapped
/// ones, and baselines ignore the address. A small pseudo-random jitter is
/// added on top, and every `spurious_every`-th attempt aborts spuriously.
#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    state: u64,
    attempts: u64,
    spurious_every: u64,
    executable: Vec<(u64, u64)>,
    mapped: Vec<(u64, u64)>,
}

impl SimulatedBackend {
    /// Create a simulated backend with a fixed jitter seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed | 1,
            attempts: 0,
            spurious_every: 0,
            executable: Vec::new(),
            mapped: Vec::new(),
        }
    }

    /// Abort every `n`-th attempt with a conflict status (0 disables).
    #[must_use]
    pub fn with_spurious_every(mut self, n: u64) -> Self {
        self.spurious_every = n;
        self
    }

    /// Treat `[base, base + len)` as mapped executable memory.
    #[must_use]
    pub fn with_executable(mut self, base: u64, len: u64) -> Self {
        self.executable.push((base, base.saturating_add(len)));
        self.mapped.push((base, base.saturating_add(len)));
        self
    }

    /// Treat `[base, base + len)` as mapped, non-executable memory.
    #[must_use]
    pub fn with_mapped(mut self, base: u64, len: u64) -> Self {
        self.mapped.push((base, base.saturating_add(len)));
        self
    }

    fn jitter(&mut self) -> u64 {
        // xorshift64
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x % 32
    }

    fn contains(regions: &[(u64, u64)], address: u64) -> bool {
        regions.iter().any(|&(lo, hi)| (lo..hi).contains(&address))
    }

    fn base_latency(&self, target: ProbeTarget) -> u64 {
        let executable = Self::contains(&self.executable, target.address);
        let mapped = Self::contains(&self.mapped, target.address);
        match target.kind {
            ProbeKind::Jmp | ProbeKind::Call if executable => 180,
            ProbeKind::Jmp | ProbeKind::Call if mapped => 210,
            ProbeKind::Jmp | ProbeKind::Call => 225,
            ProbeKind::Read | ProbeKind::Write if mapped => 200,
            ProbeKind::Read | ProbeKind::Write => 230,
            ProbeKind::Illegal | ProbeKind::Ud2 => 150,
            ProbeKind::Movdqa => 170,
        }
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new(0x5eed_d12c)
    }
}

impl ProbeBackend for SimulatedBackend {
    fn attempt(&mut self, target: ProbeTarget) -> AttemptOutcome {
        self.attempts += 1;
        if self.spurious_every > 0 && self.attempts % self.spurious_every == 0 {
            return AttemptOutcome::SpuriousAbort(AbortStatus(
                AbortStatus::CONFLICT | AbortStatus::RETRY,
            ));
        }
        let base = self.base_latency(target);
        AttemptOutcome::Faulted(CycleCount(base + self.jitter()))
    }
}

/// Attempt counters accumulated by a [`FaultSuppressedProbe`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RetryStats {
    /// Transactions started.
    pub attempts: u64,
    /// Attempts that produced a valid sample.
    pub faults: u64,
    /// Attempts discarded because of an unrelated abort.
    pub spurious: u64,
    /// Attempts discarded because the transaction committed.
    pub commits: u64,
}

/// Retry loop turning backend attempts into one valid timing sample.
#[derive(Debug)]
pub struct FaultSuppressedProbe<B: ProbeBackend> {
    backend: B,
    max_attempts: u32,
    stats: RetryStats,
}

impl<B: ProbeBackend> FaultSuppressedProbe<B> {
    /// Wrap a backend with a per-sample attempt bound.
    ///
    /// # Errors
    ///
    /// Returns [`DrkError::Config`] if `max_attempts` is zero.
    pub fn new(backend: B, max_attempts: u32) -> DrkResult<Self> {
        if max_attempts == 0 {
            return Err(DrkError::Config("max_attempts must be > 0".into()));
        }
        Ok(Self {
            backend,
            max_attempts,
            stats: RetryStats::default(),
        })
    }

    /// Obtain one fault latency for `target`.
    ///
    /// # Errors
    ///
    /// Returns [`DrkError::RetryExhausted`] if no attempt within the bound
    /// aborted because of the probe itself.
    pub fn execute(&mut self, target: ProbeTarget) -> DrkResult<CycleCount> {
        let mut spurious = 0u32;
        let mut commits = 0u32;

        for _ in 0..self.max_attempts {
            self.stats.attempts += 1;
            match self.backend.attempt(target) {
                AttemptOutcome::Faulted(cycles) => {
                    self.stats.faults += 1;
                    return Ok(cycles);
                }
                AttemptOutcome::SpuriousAbort(status) => {
                    self.stats.spurious += 1;
                    spurious += 1;
                    trace!(address = target.address, kind = %target.kind, %status, "Spurious abort");
                }
                AttemptOutcome::Committed => {
                    self.stats.commits += 1;
                    commits += 1;
                    if commits == 1 {
                        debug!(
                            address = target.address,
                            kind = %target.kind,
                            "Transaction committed; operation did not fault"
                        );
                    }
                }
            }
        }

        warn!(
            address = target.address,
            kind = %target.kind,
            attempts = self.max_attempts,
            spurious,
            commits,
            "Retry bound exhausted"
        );
        Err(DrkError::RetryExhausted {
            address: target.address,
            kind: target.kind,
            attempts: self.max_attempts,
            spurious,
            commits,
        })
    }

    /// Attempt counters since creation.
    #[must_use]
    pub fn stats(&self) -> RetryStats {
        self.stats
    }
}
