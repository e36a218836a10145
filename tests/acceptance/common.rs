//! Common utilities for integration tests.
//!
//! Provides helpers for:
//! - Checking probing prerequisites (RTM, RDTSCP, privileges)
//! - Building hardware and simulated samplers
//! - Reading acceptance thresholds from the environment

#![allow(dead_code)] // Not every test module uses every helper

use drk_common::config::RealtimeConfig;
use drk_core::hwcaps::HostCapabilities;
use drk_core::realtime::prepare_measurement_thread;
use drk_core::rtm::{RtmBackend, SimulatedBackend};
use drk_core::sampler::Sampler;

/// Default cycles by which non-executable and unmapped `jmp` latencies must
/// exceed the executable one.
pub const DEFAULT_CALIBRATION_MARGIN: u64 = 10;

/// Attempt bound used by hardware tests.
pub const HW_MAX_ATTEMPTS: u32 = 100_000;

/// Check if running as root.
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Check that fault-suppressed probing can run here.
pub fn check_probe_prerequisites() -> Result<HostCapabilities, String> {
    let caps = HostCapabilities::detect();
    caps.require_probing().map_err(|e| e.to_string())?;
    Ok(caps)
}

/// Calibration margin from `DRK_CALIBRATION_MARGIN`, or the default.
pub fn calibration_margin() -> u64 {
    std::env::var("DRK_CALIBRATION_MARGIN")
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(DEFAULT_CALIBRATION_MARGIN)
}

/// Hardware sampler on a prepared thread.
pub fn hw_sampler() -> Sampler<RtmBackend> {
    let realtime = RealtimeConfig {
        lock_memory: is_root(),
        ..RealtimeConfig::default()
    };
    prepare_measurement_thread(&realtime).expect("thread preparation failed");
    let backend = RtmBackend::new().expect("RTM backend");
    Sampler::with_backend(backend, HW_MAX_ATTEMPTS).expect("sampler")
}

/// Simulated sampler with a fixed seed.
pub fn sim_sampler(backend: SimulatedBackend) -> Sampler<SimulatedBackend> {
    Sampler::with_backend(backend, 64).expect("sampler")
}

/// Print a labelled cycle count table.
pub fn print_table(rows: &[(&str, u64)]) {
    for (label, cycles) in rows {
        println!("  {label:<14} {cycles:>8} cycles");
    }
}
