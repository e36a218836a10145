//! Configuration loading acceptance tests.

use drk_common::config::{BackendKind, CpuAffinity, DrkConfig, SchedPolicy};
use drk_common::probe::ProbeKind;
use drk_core::realtime::prepare_measurement_thread;
use std::io::Write;
use std::time::Duration;

#[test]
fn test_shipped_default_config_loads() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/default.toml");
    let config = DrkConfig::from_file(std::path::Path::new(path)).expect("config/default.toml");

    config.validate().expect("shipped config is valid");
    assert_eq!(config.probe.backend, BackendKind::Rtm);
    assert_eq!(config.scan.kinds, vec![ProbeKind::Write, ProbeKind::Jmp]);
    assert_eq!(config.realtime.cpu_affinity, CpuAffinity::None);
    assert!(!config.realtime.lock_memory);
    assert_eq!(config.calibration.unmapped_address, 0xffff_ffff_bfff_f000);
}

#[test]
fn test_shipped_realtime_section_runs_anywhere() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/default.toml");
    let config = DrkConfig::from_file(std::path::Path::new(path)).expect("config/default.toml");

    let status = prepare_measurement_thread(&config.realtime).expect("thread preparation");
    assert!(!status.memory_locked);
    assert_eq!(status.cpu_affinity, None);
}

#[test]
fn test_config_file_round_trip() {
    let mut config = DrkConfig::default();
    config.probe.backend = BackendKind::Simulated;
    config.scan.kinds = vec![ProbeKind::Call, ProbeKind::Read];
    config.scan.yield_pause = Duration::from_micros(50);
    config.realtime.policy = SchedPolicy::Fifo;
    config.realtime.cpu_affinity = CpuAffinity::Set(vec![2, 3]);

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(config.to_toml().unwrap().as_bytes()).unwrap();

    let loaded = DrkConfig::from_file(file.path()).unwrap();
    assert_eq!(loaded.probe.backend, BackendKind::Simulated);
    assert_eq!(loaded.scan.kinds, config.scan.kinds);
    assert_eq!(loaded.scan.yield_pause, Duration::from_micros(50));
    assert_eq!(loaded.realtime.policy, SchedPolicy::Fifo);
    assert_eq!(loaded.realtime.cpu_affinity, CpuAffinity::Set(vec![2, 3]));
}

#[test]
fn test_invalid_config_rejected() {
    let config = DrkConfig::from_toml("[probe]\ntrial_count = 0\n").unwrap();
    assert!(config.validate().is_err());

    assert!(DrkConfig::from_toml("[scan]\nkinds = [\"nop\"]\n").is_err());
}
