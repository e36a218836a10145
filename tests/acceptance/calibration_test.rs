//! Calibration acceptance tests.
//!
//! # Requirements
//!
//! - x86_64 CPU with TSX (RTM) enabled, for the hardware test
//!
//! # Acceptance Criteria
//!
//! - `nx_jmp_clk` and `u_jmp_clk` exceed `x_jmp_clk` by the margin in
//!   `DRK_CALIBRATION_MARGIN` (default 10 cycles)

use super::common::{
    calibration_margin, check_probe_prerequisites, hw_sampler, print_table, sim_sampler,
};
use drk_common::config::DEFAULT_UNMAPPED_ADDRESS;
use drk_core::calibrate::calibrate;
use drk_core::fixture::FixtureSet;
use drk_core::realtime::page_size;
use drk_core::rtm::SimulatedBackend;

#[test]
#[ignore = "Requires Intel TSX (RTM)"]
fn test_calibration_discriminates_page_classes() {
    if let Err(e) = check_probe_prerequisites() {
        eprintln!("Skipping test: {e}");
        return;
    }

    let fixtures = FixtureSet::provision_all(DEFAULT_UNMAPPED_ADDRESS).expect("fixtures");
    let mut sampler = hw_sampler();

    let report = calibrate(&mut sampler, &fixtures, 10_240).expect("calibration failed");

    println!("Calibration ({} trials):", report.trials);
    print_table(&[
        ("x_jmp", report.x_jmp.get()),
        ("nx_jmp", report.nx_jmp.get()),
        ("u_jmp", report.u_jmp.get()),
        ("m_write", report.m_write.get()),
        ("u_write", report.u_write.get()),
        ("ud", report.ud.get()),
    ]);
    let stats = sampler.retry_stats();
    println!(
        "  attempts={} spurious={} commits={}",
        stats.attempts, stats.spurious, stats.commits
    );

    let margin = calibration_margin();
    assert!(
        report.separates(margin),
        "Calibration did not separate by {margin} cycles: x={} nx={} u={}",
        report.x_jmp,
        report.nx_jmp,
        report.u_jmp
    );
}

#[test]
fn test_simulated_calibration_separates() {
    let fixtures = FixtureSet::provision_all(DEFAULT_UNMAPPED_ADDRESS).expect("fixtures");
    let page = page_size() as u64;
    let backend = SimulatedBackend::new(7)
        .with_spurious_every(5)
        .with_executable(fixtures.executable.address(), page)
        .with_mapped(fixtures.non_executable.address(), page);
    let mut sampler = sim_sampler(backend);

    let report = calibrate(&mut sampler, &fixtures, 1000).expect("calibration failed");

    assert!(report.separates(calibration_margin().min(20)));
    assert!(report.m_write < report.u_write);
    assert!(sampler.retry_stats().spurious > 0);
    assert_eq!(sampler.retry_stats().faults, 6 * 1000);
}
