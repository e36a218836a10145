//! Range sweep acceptance tests.
//!
//! Drive the scanner end to end with the simulated backend and check the
//! shape of the results a scan report is built from.

use super::common::{check_probe_prerequisites, hw_sampler, sim_sampler};
use drk_common::config::ScanConfig;
use drk_common::probe::{AddressRange, ProbeKind};
use drk_core::rtm::SimulatedBackend;
use drk_core::scan::Scanner;
use rand::{rngs::StdRng, Rng, SeedableRng};

#[test]
fn test_mapped_region_stands_out() {
    let base = 0xffff_ffff_8000_0000u64;
    let stride = 0x20_0000u64;
    let text = base + 8 * stride;
    let backend = SimulatedBackend::new(3).with_executable(text, 4 * stride);
    let mut scanner =
        Scanner::from_config(sim_sampler(backend), &ScanConfig::default()).expect("scanner");

    let range = AddressRange::new(base, base + 32 * stride, stride).unwrap();
    let result = scanner.scan(&[range], 200).expect("scan");

    assert_eq!(result.len(), 32);
    assert_eq!(result.kinds, vec![ProbeKind::Write, ProbeKind::Jmp]);
    let fast: Vec<u64> = result
        .results_for(ProbeKind::Jmp)
        .filter(|r| r.min_cycles.get() < 200)
        .map(|r| r.target.address)
        .collect();
    assert_eq!(fast, (8..12).map(|i| base + i * stride).collect::<Vec<_>>());
}

#[test]
fn test_random_ranges_cover_every_address() {
    let mut rng = StdRng::seed_from_u64(42);
    let ranges: Vec<AddressRange> = (0..8)
        .map(|_| {
            let base = rng.gen_range(0..u64::MAX / 2) & !0xfff;
            let stride = 0x1000u64 << rng.gen_range(0..4);
            let count = rng.gen_range(0..20u64);
            AddressRange::new(base, base + count * stride, stride).unwrap()
        })
        .collect();
    let expected: Vec<u64> = ranges.iter().flat_map(AddressRange::addresses).collect();

    let mut scanner = Scanner::new(
        sim_sampler(SimulatedBackend::default()),
        vec![ProbeKind::Read, ProbeKind::Movdqa, ProbeKind::Call],
    )
    .expect("scanner");
    let result = scanner.scan(&ranges, 2).expect("scan");

    let probed: Vec<u64> = result.rows().iter().map(|r| r.address).collect();
    assert_eq!(probed, expected);
    assert!(result.rows().iter().all(|r| r.results.len() == 3));
}

#[test]
fn test_repeated_sweeps_are_independent() {
    let mut scanner = Scanner::new(
        sim_sampler(SimulatedBackend::default()),
        vec![ProbeKind::Jmp],
    )
    .expect("scanner");
    let range = AddressRange::new(0x10_0000, 0x20_0000, 0x4_0000).unwrap();

    let mut sweeps = Vec::new();
    let done = scanner
        .repeat(&[range], 10, 4, |result| sweeps.push(result))
        .expect("repeat");

    assert_eq!(done, 4);
    assert_eq!(sweeps.len(), 4);
    for (index, sweep) in sweeps.iter().enumerate() {
        assert_eq!(sweep.repeat as usize, index);
        assert_eq!(sweep.len(), 4);
    }
}

#[test]
#[ignore = "Requires Intel TSX (RTM)"]
fn test_hardware_scan_of_kernel_text() {
    if let Err(e) = check_probe_prerequisites() {
        eprintln!("Skipping test: {e}");
        return;
    }

    let base = 0xffff_ffff_8000_0000u64;
    let range = AddressRange::new(base, base + 0x4000_0000, 0x20_0000).unwrap();
    let mut scanner = Scanner::from_config(hw_sampler(), &ScanConfig::default()).expect("scanner");

    let result = scanner.scan(&[range], 1000).expect("scan");

    assert_eq!(result.len(), 512);
    println!("Elapsed: {} us, yields: {}", result.elapsed.as_micros(), result.yields);
    for row in result.rows().iter().take(16) {
        let minima: Vec<u64> = row.minima().map(|c| c.get()).collect();
        println!("  {:#x} {:?}", row.address, minima);
    }
}
