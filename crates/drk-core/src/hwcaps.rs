//! Host capability detection.
//!
//! Probing needs RTM for the transactional region and RDTSCP for the closing
//! timestamp. Both are checked through CPUID before the first measurement,
//! since executing either on a CPU without them raises #UD outside any
//! transaction and kills the process.

use drk_common::error::{DrkError, DrkResult};
use serde::Serialize;
use std::fs;
use tracing::{debug, info};

/// Information about the host CPU and kernel relevant to probing.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HostCapabilities {
    /// CPUID vendor string (e.g. "GenuineIntel").
    pub vendor: String,
    /// Model name from `/proc/cpuinfo`, if readable.
    pub model_name: Option<String>,
    /// Restricted Transactional Memory (CPUID.07H:EBX[11]).
    pub rtm: bool,
    /// Hardware Lock Elision (CPUID.07H:EBX[4]).
    pub hle: bool,
    /// Microcode aborts every RTM transaction (CPUID.07H:EDX[11]).
    pub rtm_always_abort: bool,
    /// RDTSCP instruction (CPUID.80000001H:EDX[27]).
    pub rdtscp: bool,
    /// TSC runs at a constant rate across P/C-states (CPUID.80000007H:EDX[8]).
    pub invariant_tsc: bool,
    /// Whether the kernel advertises `rtm` in `/proc/cpuinfo` flags.
    pub cpuinfo_rtm: Option<bool>,
    /// Kernel release from `/proc/sys/kernel/osrelease`.
    pub kernel_release: Option<String>,
    /// Whether the kernel command line mentions `kaslr` / `nokaslr`.
    pub kaslr_cmdline: Option<KaslrSetting>,
}

/// KASLR setting found on the kernel command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KaslrSetting {
    /// `kaslr` given explicitly.
    Enabled,
    /// `nokaslr` given.
    Disabled,
    /// Neither given; the kernel default applies.
    Default,
}

impl HostCapabilities {
    /// Query CPUID and procfs.
    #[must_use]
    pub fn detect() -> Self {
        let mut caps = Self::from_cpuid();

        if let Ok(cpuinfo) = fs::read_to_string("/proc/cpuinfo") {
            caps.model_name = parse_model_name(&cpuinfo);
            caps.cpuinfo_rtm = Some(cpuinfo_has_flag(&cpuinfo, "rtm"));
        }
        caps.kernel_release = fs::read_to_string("/proc/sys/kernel/osrelease")
            .ok()
            .map(|s| s.trim().to_string());
        caps.kaslr_cmdline = fs::read_to_string("/proc/cmdline")
            .ok()
            .map(|s| parse_kaslr(&s));

        debug!(?caps, "Host capabilities detected");
        caps
    }

    #[cfg(target_arch = "x86_64")]
    fn from_cpuid() -> Self {
        use core::arch::x86_64::{__cpuid, __cpuid_count};

        // SAFETY: CPUID is available on every x86_64 processor.
        let leaf0 = unsafe { __cpuid(0) };
        let vendor = vendor_string(leaf0.ebx, leaf0.edx, leaf0.ecx);

        let (rtm, hle, rtm_always_abort) = if leaf0.eax >= 7 {
            // SAFETY: leaf 7 is within the reported maximum.
            let leaf7 = unsafe { __cpuid_count(7, 0) };
            (
                leaf7.ebx & (1 << 11) != 0,
                leaf7.ebx & (1 << 4) != 0,
                leaf7.edx & (1 << 11) != 0,
            )
        } else {
            (false, false, false)
        };

        // SAFETY: the extended range query is always valid.
        let ext_max = unsafe { __cpuid(0x8000_0000) }.eax;
        let rdtscp = ext_max >= 0x8000_0001
            // SAFETY: leaf within the reported extended maximum.
            && unsafe { __cpuid(0x8000_0001) }.edx & (1 << 27) != 0;
        let invariant_tsc = ext_max >= 0x8000_0007
            // SAFETY: leaf within the reported extended maximum.
            && unsafe { __cpuid(0x8000_0007) }.edx & (1 << 8) != 0;

        Self {
            vendor,
            rtm,
            hle,
            rtm_always_abort,
            rdtscp,
            invariant_tsc,
            ..Self::default()
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn from_cpuid() -> Self {
        Self {
            vendor: std::env::consts::ARCH.to_string(),
            ..Self::default()
        }
    }

    /// Whether fault-suppressed probing can run on this host.
    #[must_use]
    pub fn supports_probing(&self) -> bool {
        self.missing_features().is_empty()
    }

    /// Fail unless fault-suppressed probing can run on this host.
    ///
    /// A CPU that advertises RTM but aborts every transaction (microcode
    /// `RTM_ALWAYS_ABORT`, or TSX turned off by the kernel) aborts with
    /// status 0 before the probe runs, which is indistinguishable from a
    /// probe fault. Such hosts are rejected here.
    ///
    /// # Errors
    ///
    /// Returns [`DrkError::HardwareUnsupported`] naming every missing feature.
    pub fn require_probing(&self) -> DrkResult<()> {
        let missing = self.missing_features();
        if missing.is_empty() {
            info!(vendor = %self.vendor, "RTM probing supported");
            Ok(())
        } else {
            Err(DrkError::HardwareUnsupported(format!(
                "missing {}",
                missing.join(", ")
            )))
        }
    }

    fn missing_features(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if !cfg!(target_arch = "x86_64") {
            missing.push(format!("x86_64 (running on {})", std::env::consts::ARCH));
        }
        if !self.rtm {
            missing.push("RTM (Intel TSX)".to_string());
        } else if self.rtm_always_abort {
            missing.push("RTM (force-aborted by microcode, RTM_ALWAYS_ABORT)".to_string());
        } else if self.cpuinfo_rtm == Some(false) {
            missing.push("RTM (disabled by the kernel, absent from /proc/cpuinfo)".to_string());
        }
        if !self.rdtscp {
            missing.push("RDTSCP".to_string());
        }
        missing
    }
}

#[cfg(target_arch = "x86_64")]
fn vendor_string(ebx: u32, edx: u32, ecx: u32) -> String {
    let mut bytes = Vec::with_capacity(12);
    for word in [ebx, edx, ecx] {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    String::from_utf8_lossy(&bytes).trim_end_matches('\0').to_string()
}

fn parse_model_name(cpuinfo: &str) -> Option<String> {
    cpuinfo
        .lines()
        .find(|line| line.starts_with("model name"))
        .and_then(|line| line.split_once(':'))
        .map(|(_, value)| value.trim().to_string())
}

fn cpuinfo_has_flag(cpuinfo: &str, flag: &str) -> bool {
    cpuinfo
        .lines()
        .filter(|line| line.starts_with("flags"))
        .filter_map(|line| line.split_once(':'))
        .any(|(_, flags)| flags.split_whitespace().any(|f| f == flag))
}

fn parse_kaslr(cmdline: &str) -> KaslrSetting {
    let mut setting = KaslrSetting::Default;
    for word in cmdline.split_whitespace() {
        match word {
            "kaslr" => setting = KaslrSetting::Enabled,
            "nokaslr" => setting = KaslrSetting::Disabled,
            _ => {}
        }
    }
    setting
}

#[cfg(test)]
mod tests {
    use super::*;

    const CPUINFO: &str = "processor\t: 0\n\
        vendor_id\t: GenuineIntel\n\
        model name\t: Intel(R) Core(TM) i7-6700K CPU @ 4.00GHz\n\
        flags\t\t: fpu vme de pse tsc msr hle rtm rdseed adx\n";

    #[test]
    fn test_parse_model_name() {
        assert_eq!(
            parse_model_name(CPUINFO).as_deref(),
            Some("Intel(R) Core(TM) i7-6700K CPU @ 4.00GHz")
        );
        assert!(parse_model_name("processor : 0\n").is_none());
    }

    #[test]
    fn test_cpuinfo_flags() {
        assert!(cpuinfo_has_flag(CPUINFO, "rtm"));
        assert!(cpuinfo_has_flag(CPUINFO, "hle"));
        assert!(!cpuinfo_has_flag(CPUINFO, "rt"));
        assert!(!cpuinfo_has_flag(CPUINFO, "avx512f"));
    }

    #[test]
    fn test_parse_kaslr() {
        assert_eq!(parse_kaslr("BOOT_IMAGE=/vmlinuz ro kaslr quiet"), KaslrSetting::Enabled);
        assert_eq!(parse_kaslr("ro nokaslr"), KaslrSetting::Disabled);
        assert_eq!(parse_kaslr("ro quiet splash"), KaslrSetting::Default);
    }

    #[test]
    fn test_require_probing_reports_missing() {
        let caps = HostCapabilities {
            vendor: "GenuineIntel".into(),
            rtm: false,
            rdtscp: true,
            ..Default::default()
        };
        let err = caps.require_probing().unwrap_err();
        match err {
            DrkError::HardwareUnsupported(msg) => assert!(msg.contains("RTM")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!caps.supports_probing());
    }

    fn usable_host() -> HostCapabilities {
        HostCapabilities {
            vendor: "GenuineIntel".into(),
            rtm: true,
            rdtscp: true,
            cpuinfo_rtm: Some(true),
            ..Default::default()
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_usable_host_passes() {
        let caps = usable_host();
        assert!(caps.require_probing().is_ok());
        assert!(caps.supports_probing());
    }

    #[test]
    fn test_kernel_disabled_rtm_rejected() {
        let caps = HostCapabilities {
            cpuinfo_rtm: Some(false),
            ..usable_host()
        };
        match caps.require_probing().unwrap_err() {
            DrkError::HardwareUnsupported(msg) => assert!(msg.contains("/proc/cpuinfo")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!caps.supports_probing());
    }

    #[test]
    fn test_rtm_always_abort_rejected() {
        let caps = HostCapabilities {
            rtm_always_abort: true,
            ..usable_host()
        };
        match caps.require_probing().unwrap_err() {
            DrkError::HardwareUnsupported(msg) => assert!(msg.contains("RTM_ALWAYS_ABORT")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!caps.supports_probing());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_unreadable_cpuinfo_does_not_reject() {
        let caps = HostCapabilities {
            cpuinfo_rtm: None,
            ..usable_host()
        };
        assert!(caps.require_probing().is_ok());
    }

    #[test]
    fn test_detect_does_not_panic() {
        let caps = HostCapabilities::detect();
        // Just verify it doesn't panic and agrees with itself
        assert_eq!(caps.supports_probing(), caps.require_probing().is_ok());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_vendor_string() {
        // "GenuineIntel" split across ebx, edx, ecx
        let vendor = vendor_string(0x756e_6547, 0x4965_6e69, 0x6c65_746e);
        assert_eq!(vendor, "GenuineIntel");
    }
}
