//! Probe targets, address ranges, and the result values produced by sampling
//! and scanning.
//!
//! Addresses are plain `u64` values everywhere in this module. Only the
//! probe backends turn them into real memory references.

use crate::error::{DrkError, DrkResult};
use crate::time::CycleCount;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Fault-inducing operation executed inside the transactional region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProbeKind {
    /// Indirect `call` to the target; faults unless the page is executable.
    #[serde(rename = "call", alias = "calleax", alias = "callfunc")]
    Call,
    /// Indirect `jmp` to the target; faults unless the page is executable.
    #[serde(rename = "jmp")]
    Jmp,
    /// 4-byte load; faults on unmapped or supervisor-only pages.
    #[serde(rename = "read", alias = "readmem")]
    Read,
    /// 4-byte store of zero; faults on unmapped or read-only pages.
    #[serde(rename = "write", alias = "writemem")]
    Write,
    /// Fixed invalid opcode at a known location; ignores the target.
    #[serde(rename = "ill", alias = "illegal")]
    Illegal,
    /// `ud2` at a known location; ignores the target.
    #[serde(rename = "ud2")]
    Ud2,
    /// Aligned vector load from `target + 1`; always raises #GP.
    #[serde(rename = "movdqa", alias = "unaligned")]
    Movdqa,
}

impl ProbeKind {
    /// Every kind in catalog order.
    pub const ALL: [ProbeKind; 7] = [
        ProbeKind::Call,
        ProbeKind::Jmp,
        ProbeKind::Read,
        ProbeKind::Write,
        ProbeKind::Illegal,
        ProbeKind::Ud2,
        ProbeKind::Movdqa,
    ];

    /// Canonical name used on the command line and in reports.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ProbeKind::Call => "call",
            ProbeKind::Jmp => "jmp",
            ProbeKind::Read => "read",
            ProbeKind::Write => "write",
            ProbeKind::Illegal => "ill",
            ProbeKind::Ud2 => "ud2",
            ProbeKind::Movdqa => "movdqa",
        }
    }

    /// Whether the operation dereferences or transfers control to the target.
    ///
    /// Baseline kinds fault the same way regardless of the address.
    #[must_use]
    pub fn uses_target(self) -> bool {
        !matches!(self, ProbeKind::Illegal | ProbeKind::Ud2 | ProbeKind::Movdqa)
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProbeKind {
    type Err = DrkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "call" | "calleax" | "callfunc" => Ok(ProbeKind::Call),
            "jmp" => Ok(ProbeKind::Jmp),
            "read" | "readmem" => Ok(ProbeKind::Read),
            "write" | "writemem" => Ok(ProbeKind::Write),
            "ill" | "illegal" => Ok(ProbeKind::Illegal),
            "ud2" => Ok(ProbeKind::Ud2),
            "movdqa" | "unaligned" => Ok(ProbeKind::Movdqa),
            _ => Err(DrkError::UnknownProbeKind(s.to_string())),
        }
    }
}

/// Permission class of a calibration page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FixtureClass {
    /// Mapped read/write/execute page.
    #[serde(rename = "x")]
    Executable,
    /// Mapped read-only page.
    #[serde(rename = "nx")]
    NonExecutable,
    /// Fixed address that is never mapped in user space.
    #[serde(rename = "u")]
    Unmapped,
}

impl FixtureClass {
    /// Short name used on the command line.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            FixtureClass::Executable => "x",
            FixtureClass::NonExecutable => "nx",
            FixtureClass::Unmapped => "u",
        }
    }
}

impl fmt::Display for FixtureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FixtureClass {
    type Err = DrkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x" => Ok(FixtureClass::Executable),
            "nx" => Ok(FixtureClass::NonExecutable),
            "u" => Ok(FixtureClass::Unmapped),
            _ => Err(DrkError::UnknownFixtureClass(s.to_string())),
        }
    }
}

/// One address paired with the operation used to probe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProbeTarget {
    /// Probed address.
    pub address: u64,
    /// Operation executed against the address.
    pub kind: ProbeKind,
}

impl ProbeTarget {
    /// Create a new probe target.
    #[must_use]
    pub fn new(address: u64, kind: ProbeKind) -> Self {
        Self { address, kind }
    }
}

/// Minimum fault latency observed for one target over a number of trials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// What was probed.
    pub target: ProbeTarget,
    /// Smallest cycle count over all trials.
    pub min_cycles: CycleCount,
    /// Number of valid trials taken.
    pub trials: u32,
}

/// Half-open address interval walked with a fixed stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AddressRange {
    base: u64,
    end: u64,
    stride: u64,
}

impl AddressRange {
    /// Create a range, enforcing `base <= end` and `stride > 0`.
    ///
    /// # Errors
    ///
    /// Returns [`DrkError::InvalidRange`] if either invariant is violated.
    pub fn new(base: u64, end: u64, stride: u64) -> DrkResult<Self> {
        if base > end || stride == 0 {
            return Err(DrkError::InvalidRange { base, end, stride });
        }
        Ok(Self { base, end, stride })
    }

    /// First address of the range.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Exclusive end address.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Step between probed addresses.
    #[must_use]
    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// Number of addresses the range yields.
    #[must_use]
    pub fn len(&self) -> u64 {
        (self.end - self.base).div_ceil(self.stride)
    }

    /// Whether the range yields no address at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.base == self.end
    }

    /// Iterate the probed addresses in increasing order.
    #[must_use]
    pub fn addresses(&self) -> RangeAddresses {
        RangeAddresses {
            next: (self.base < self.end).then_some(self.base),
            end: self.end,
            stride: self.stride,
        }
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:#x}, {:#x}) step {:#x}",
            self.base, self.end, self.stride
        )
    }
}

/// Iterator over the addresses of an [`AddressRange`].
#[derive(Debug, Clone)]
pub struct RangeAddresses {
    next: Option<u64>,
    end: u64,
    stride: u64,
}

impl Iterator for RangeAddresses {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let current = self.next?;
        // Stop instead of wrapping when the stride walks off the top of the address space
        self.next = current
            .checked_add(self.stride)
            .filter(|&next| next < self.end);
        Some(current)
    }
}

/// All probe results for one address, one per scanned kind, in kind order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRow {
    /// Probed address.
    pub address: u64,
    /// One result per configured kind.
    pub results: Vec<ProbeResult>,
}

impl ScanRow {
    /// Minimum cycle counts in kind order.
    pub fn minima(&self) -> impl Iterator<Item = CycleCount> + '_ {
        self.results.iter().map(|r| r.min_cycles)
    }
}

/// Output of one full sweep over a list of ranges.
///
/// Rows are append-only and keep the order in which addresses were probed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    /// Zero-based repetition index of this sweep.
    pub repeat: u32,
    /// Probe kinds sampled for every address, in column order.
    pub kinds: Vec<ProbeKind>,
    /// Wall time spent on the sweep.
    pub elapsed: Duration,
    /// Voluntary processor yields performed during the sweep.
    pub yields: u64,
    rows: Vec<ScanRow>,
}

impl ScanResult {
    /// Start an empty result for the given column kinds.
    #[must_use]
    pub fn new(repeat: u32, kinds: Vec<ProbeKind>) -> Self {
        Self {
            repeat,
            kinds,
            elapsed: Duration::ZERO,
            yields: 0,
            rows: Vec::new(),
        }
    }

    /// Append a row.
    ///
    /// # Errors
    ///
    /// Returns an error if the row does not carry exactly one result per
    /// configured kind, in kind order.
    pub fn push_row(&mut self, row: ScanRow) -> DrkResult<()> {
        let matches = row.results.len() == self.kinds.len()
            && row
                .results
                .iter()
                .zip(&self.kinds)
                .all(|(r, &k)| r.target.kind == k && r.target.address == row.address);
        if !matches {
            return Err(DrkError::Config(format!(
                "scan row for {:#x} does not match columns {:?}",
                row.address, self.kinds
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Rows in probe order.
    #[must_use]
    pub fn rows(&self) -> &[ScanRow] {
        &self.rows
    }

    /// Number of probed addresses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no address was probed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Results of one kind across all rows, in probe order.
    pub fn results_for(&self, kind: ProbeKind) -> impl Iterator<Item = &ProbeResult> + '_ {
        self.rows
            .iter()
            .flat_map(|row| row.results.iter())
            .filter(move |r| r.target.kind == kind)
    }
}
