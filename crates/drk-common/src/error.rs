use crate::probe::ProbeKind;
use thiserror::Error;

/// Probe error types covering hardware support, retry exhaustion, and boundary failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DrkError {
    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The host CPU lacks an instruction the probe depends on.
    #[error("hardware unsupported: {0}")]
    HardwareUnsupported(String),

    /// Every attempt for one trial either committed or aborted spuriously.
    #[error(
        "retry bound exhausted probing {address:#x} with {kind}: \
         {attempts} attempts ({spurious} spurious aborts, {commits} commits)"
    )]
    RetryExhausted {
        /// Probed address.
        address: u64,
        /// Probe operation.
        kind: ProbeKind,
        /// Attempts made before giving up.
        attempts: u32,
        /// Attempts aborted for a reason other than the probe fault.
        spurious: u32,
        /// Attempts whose transaction committed.
        commits: u32,
    },

    /// Address range violates `base <= end` or `stride > 0`.
    #[error("invalid address range: base {base:#x}, end {end:#x}, stride {stride:#x}")]
    InvalidRange {
        /// First address.
        base: u64,
        /// Exclusive end address.
        end: u64,
        /// Step between addresses.
        stride: u64,
    },

    /// Probe kind name did not match the catalog.
    #[error("unknown probe kind: {0}")]
    UnknownProbeKind(String),

    /// Fixture class name did not match `x`, `nx` or `u`.
    #[error("unknown fixture class: {0}")]
    UnknownFixtureClass(String),

    /// Calibration page could not be mapped or initialized.
    #[error("fixture error: {0}")]
    Fixture(String),

    /// I/O operation error.
    #[error("I/O error: {0}")]
    Io(String),
}

/// Convenience type alias for probe operations.
pub type DrkResult<T> = Result<T, DrkError>;
