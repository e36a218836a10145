//! Configuration structures for the probe tool.
//!
//! Supports TOML deserialization with every field defaulted, so an empty
//! file is a valid configuration.

use crate::error::{DrkError, DrkResult};
use crate::probe::ProbeKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Address standing in for a privileged, never-mapped page (top of the
/// x86_64 kernel text region, below the default module area).
pub const DEFAULT_UNMAPPED_ADDRESS: u64 = 0xffff_ffff_bfff_f000;

/// Default number of trials per probe target.
pub const DEFAULT_TRIAL_COUNT: u32 = 10_240;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DrkConfig {
    /// Probe backend and retry configuration.
    pub probe: ProbeConfig,

    /// Range sweep configuration.
    pub scan: ScanConfig,

    /// Built-in calibration mode configuration.
    pub calibration: CalibrationConfig,

    /// Measurement thread preparation.
    pub realtime: RealtimeConfig,
}

/// Which probe backend executes transactional attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Hardware RTM transactions (x86_64 with TSX).
    #[default]
    Rtm,
    /// Synthetic latencies for hosts without TSX.
    Simulated,
}

/// Probe configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Backend used for every attempt.
    pub backend: BackendKind,

    /// Trials per target; the minimum over all trials is reported.
    pub trial_count: u32,

    /// Attempts allowed per trial before giving up on a target.
    /// Spurious aborts and committed transactions both consume attempts.
    pub max_attempts: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Rtm,
            trial_count: DEFAULT_TRIAL_COUNT,
            max_attempts: 100_000,
        }
    }
}

/// Range sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Kinds sampled for every address, in output column order.
    pub kinds: Vec<ProbeKind>,

    /// Number of full sweeps; each is written to its own file.
    pub repeat: u32,

    /// Yield on every address until this many have been probed in a range.
    pub yield_warmup: u32,

    /// After warm-up, yield on every Nth address of a range.
    pub yield_every: u32,

    /// Length of each voluntary pause; zero means a plain `sched_yield`.
    #[serde(with = "humantime_serde")]
    pub yield_pause: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            kinds: vec![ProbeKind::Write, ProbeKind::Jmp],
            repeat: 1,
            yield_warmup: 10,
            yield_every: 16,
            yield_pause: Duration::ZERO,
        }
    }
}

/// Built-in calibration mode configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Placeholder address probed as the unmapped fixture.
    #[serde(with = "hex_u64")]
    pub unmapped_address: u64,

    /// Lower bound applied to the trial count in calibration mode.
    pub min_trials: u32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            unmapped_address: DEFAULT_UNMAPPED_ADDRESS,
            min_trials: 1000,
        }
    }
}

/// Measurement thread preparation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// CPU affinity for the measuring thread.
    pub cpu_affinity: CpuAffinity,

    /// Lock all memory pages (mlockall) so fixture and stack pages stay resident.
    pub lock_memory: bool,

    /// Pre-fault stack size in bytes.
    pub prefault_stack_size: usize,

    /// Scheduler policy for the measuring thread.
    pub policy: SchedPolicy,

    /// Scheduler priority (1-99 for RT policies).
    pub priority: u8,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            cpu_affinity: CpuAffinity::None,
            lock_memory: false,
            prefault_stack_size: 256 * 1024, // 256 KiB
            policy: SchedPolicy::Other,
            priority: 50,
        }
    }
}

/// Scheduler policy for the measuring thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    /// SCHED_FIFO: First-in-first-out real-time.
    Fifo,
    /// SCHED_RR: Round-robin real-time.
    Rr,
    /// SCHED_OTHER: Normal time-sharing (non-RT).
    #[default]
    Other,
}

/// CPU affinity specification.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CpuAffinity {
    /// No affinity set (OS chooses).
    #[default]
    None,
    /// Pin to a single CPU core.
    Single(usize),
    /// Pin to a set of CPU cores.
    Set(Vec<usize>),
}

impl Serialize for CpuAffinity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            CpuAffinity::None => serializer.serialize_none(),
            CpuAffinity::Single(cpu) => serializer.serialize_u64(*cpu as u64),
            CpuAffinity::Set(cpus) => cpus.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for CpuAffinity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct CpuAffinityVisitor;

        impl<'de> Visitor<'de> for CpuAffinityVisitor {
            type Value = CpuAffinity;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("null, an integer, or an array of integers")
            }

            fn visit_none<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::None)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::None)
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                usize::try_from(value)
                    .map(CpuAffinity::Single)
                    .map_err(|_| de::Error::custom("CPU index out of range"))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                usize::try_from(value)
                    .map(CpuAffinity::Single)
                    .map_err(|_| de::Error::custom("CPU index cannot be negative"))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut cpus = Vec::new();
                while let Some(cpu) = seq.next_element::<usize>()? {
                    cpus.push(cpu);
                }
                Ok(CpuAffinity::Set(cpus))
            }
        }

        deserializer.deserialize_any(CpuAffinityVisitor)
    }
}

impl DrkConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check values that would make a run meaningless.
    ///
    /// # Errors
    ///
    /// Returns [`DrkError::Config`] naming the first offending field.
    pub fn validate(&self) -> DrkResult<()> {
        if self.probe.trial_count == 0 {
            return Err(DrkError::Config("probe.trial_count must be > 0".into()));
        }
        if self.probe.max_attempts == 0 {
            return Err(DrkError::Config("probe.max_attempts must be > 0".into()));
        }
        if self.scan.kinds.is_empty() {
            return Err(DrkError::Config("scan.kinds must not be empty".into()));
        }
        if self.scan.yield_every == 0 {
            return Err(DrkError::Config("scan.yield_every must be > 0".into()));
        }
        Ok(())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde helper for 64-bit addresses, which overflow TOML's signed integers.
mod hex_u64 {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{value:#x}"))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let digits = s
            .trim()
            .trim_start_matches("0x")
            .trim_start_matches("0X")
            .replace('_', "");
        u64::from_str_radix(&digits, 16).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DrkConfig::default();
        assert_eq!(config.probe.trial_count, 10_240);
        assert_eq!(config.probe.backend, BackendKind::Rtm);
        assert_eq!(config.scan.kinds, vec![ProbeKind::Write, ProbeKind::Jmp]);
        assert_eq!(config.calibration.unmapped_address, DEFAULT_UNMAPPED_ADDRESS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            [probe]
            backend = "simulated"
            trial_count = 2000
            max_attempts = 500

            [scan]
            kinds = ["readmem", "jmp", "call"]
            repeat = 3
            yield_pause = "50us"

            [calibration]
            unmapped_address = "0xffffffff80000000"

            [realtime]
            cpu_affinity = 3
            lock_memory = true
        "#;

        let config = DrkConfig::from_toml(toml).unwrap();
        assert_eq!(config.probe.backend, BackendKind::Simulated);
        assert_eq!(config.probe.trial_count, 2000);
        assert_eq!(config.probe.max_attempts, 500);
        assert_eq!(
            config.scan.kinds,
            vec![ProbeKind::Read, ProbeKind::Jmp, ProbeKind::Call]
        );
        assert_eq!(config.scan.repeat, 3);
        assert_eq!(config.scan.yield_pause, Duration::from_micros(50));
        assert_eq!(config.calibration.unmapped_address, 0xffff_ffff_8000_0000);
        assert_eq!(config.realtime.cpu_affinity, CpuAffinity::Single(3));
        assert!(config.realtime.lock_memory);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = DrkConfig::from_toml("").unwrap();
        assert_eq!(config.probe.trial_count, DEFAULT_TRIAL_COUNT);
        assert_eq!(config.scan.yield_every, 16);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let toml = r#"
            [scan]
            kinds = ["teleport"]
        "#;
        assert!(DrkConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_cpu_affinity_variants() {
        let single: CpuAffinity = serde_json::from_str("3").unwrap();
        assert_eq!(single, CpuAffinity::Single(3));

        let set: CpuAffinity = serde_json::from_str("[1, 2, 3]").unwrap();
        assert_eq!(set, CpuAffinity::Set(vec![1, 2, 3]));

        let none: CpuAffinity = serde_json::from_str("null").unwrap();
        assert_eq!(none, CpuAffinity::None);
    }

    #[test]
    fn test_roundtrip_toml() {
        let mut config = DrkConfig::default();
        config.scan.yield_pause = Duration::from_millis(2);
        let toml = config.to_toml().unwrap();
        let parsed = DrkConfig::from_toml(&toml).unwrap();
        assert_eq!(parsed.scan.yield_pause, Duration::from_millis(2));
        assert_eq!(
            parsed.calibration.unmapped_address,
            config.calibration.unmapped_address
        );
        assert!(
            toml.contains("0xffffffffbffff000"),
            "Expected hex address in serialized TOML: {}",
            toml
        );
    }

    #[test]
    fn test_validate_rejects_zero_trials() {
        let mut config = DrkConfig::default();
        config.probe.trial_count = 0;
        assert!(matches!(config.validate(), Err(DrkError::Config(_))));

        let mut config = DrkConfig::default();
        config.scan.kinds.clear();
        assert!(config.validate().is_err());
    }
}
