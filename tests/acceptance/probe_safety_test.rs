//! Probe safety acceptance tests.
//!
//! Every probe kind must return control to the caller for any address,
//! whether it is mapped, unmapped, kernel, non-canonical or misaligned.
//! A single escaped fault kills the test process, so surviving the loop is
//! the assertion.
//!
//! # Requirements
//!
//! - x86_64 CPU with TSX (RTM) enabled

use super::common::{check_probe_prerequisites, hw_sampler};
use drk_common::error::DrkError;
use drk_common::probe::{ProbeKind, ProbeTarget};
use drk_common::time::CycleCount;
use drk_core::timing;
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Addresses that exercise every page-table outcome.
fn interesting_addresses(rng: &mut StdRng) -> Vec<u64> {
    let mut addresses = vec![
        0,
        0x1000,
        0x0000_7fff_ffff_f000, // top of user space
        0x0000_8000_0000_0000, // first non-canonical
        0xffff_8000_0000_0000, // start of kernel half
        0xffff_ffff_8000_0000, // kernel text base
        0xffff_ffff_bfff_f000, // unmapped placeholder
        u64::MAX,
    ];
    addresses.extend((0..64).map(|_| rng.gen::<u64>()));
    addresses.extend((0..64).map(|_| 0xffff_ffff_8000_0000 + (rng.gen_range(0..512u64) << 21)));
    addresses
}

#[test]
#[ignore = "Requires Intel TSX (RTM)"]
fn test_probes_never_escape() {
    if let Err(e) = check_probe_prerequisites() {
        eprintln!("Skipping test: {e}");
        return;
    }

    let mut rng = StdRng::seed_from_u64(0xd12c);
    let mut sampler = hw_sampler();
    let addresses = interesting_addresses(&mut rng);

    let mut exhausted = 0usize;
    for &address in &addresses {
        for kind in ProbeKind::ALL {
            match sampler.sample(ProbeTarget::new(address, kind), 16) {
                Ok(result) => assert!(result.min_cycles > CycleCount(0)),
                Err(DrkError::RetryExhausted { .. }) => exhausted += 1,
                Err(e) => panic!("{address:#x} {kind}: unexpected error {e}"),
            }
        }
    }

    let stats = sampler.retry_stats();
    println!(
        "Probed {} targets: attempts={} faults={} spurious={} commits={} exhausted={exhausted}",
        addresses.len() * ProbeKind::ALL.len(),
        stats.attempts,
        stats.faults,
        stats.spurious,
        stats.commits
    );
    assert!(stats.faults > 0);
}

#[test]
fn test_timed_region_is_positive() {
    let mut acc = 0u64;
    let start = timing::begin();
    for i in 0..1000u64 {
        acc = std::hint::black_box(acc.wrapping_add(i));
    }
    let stop = timing::end();
    assert!(stop.since(start) > CycleCount(0));
    assert_eq!(acc, 999 * 1000 / 2);
}
