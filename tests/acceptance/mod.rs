//! Integration tests for DrK probe acceptance testing.
//!
//! Simulated-backend tests run everywhere. Tests marked
//! `#[ignore = "Requires Intel TSX (RTM)"]` drive the hardware backend and
//! skip themselves when the CPU lacks RTM.

mod calibration_test;
mod common;
mod config_test;
mod probe_safety_test;
mod scan_test;
