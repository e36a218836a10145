//! Measuring-thread preparation.
//!
//! A sample is only as good as the quietest trial, so the thread that runs
//! the probes is pinned to one CPU, optionally moved to a real-time policy,
//! and has its stack and heap made resident before the first transaction.
//! A page fault taken while the fixture or stack is being touched would
//! otherwise show up as a spurious abort.

use drk_common::config::{CpuAffinity, RealtimeConfig, SchedPolicy};
use drk_common::error::{DrkError, DrkResult};
use serde::Serialize;
use tracing::{debug, info, warn};

/// What [`prepare_measurement_thread`] managed to apply.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RealtimeStatus {
    /// Whether all pages were locked.
    pub memory_locked: bool,
    /// Stack bytes pre-faulted.
    pub stack_prefaulted: usize,
    /// Applied scheduler policy.
    pub scheduler_policy: Option<SchedPolicy>,
    /// Applied scheduler priority.
    pub scheduler_priority: Option<u8>,
    /// CPUs the thread is pinned to.
    pub cpu_affinity: Option<Vec<usize>>,
}

/// Prepare the calling thread for measurement.
///
/// Missing privileges (EPERM) are logged and skipped; the run continues with
/// noisier samples.
///
/// # Errors
///
/// Returns [`DrkError::Config`] for an invalid CPU index or an unexpected
/// failure of `mlockall`, `sched_setscheduler` or `sched_setaffinity`.
pub fn prepare_measurement_thread(config: &RealtimeConfig) -> DrkResult<RealtimeStatus> {
    let cpu_affinity = set_cpu_affinity(&config.cpu_affinity)?;

    let memory_locked = if config.lock_memory {
        lock_memory()?
    } else {
        false
    };

    let stack_prefaulted = prefault_stack(config.prefault_stack_size);

    let (scheduler_policy, scheduler_priority) = set_scheduler(config.policy, config.priority)?;

    let status = RealtimeStatus {
        memory_locked,
        stack_prefaulted,
        scheduler_policy,
        scheduler_priority,
        cpu_affinity,
    };
    info!(?status, "Measuring thread prepared");
    Ok(status)
}

#[cfg(target_os = "linux")]
fn lock_memory() -> DrkResult<bool> {
    use nix::sys::mman::{mlockall, MlockAllFlags};

    match mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        Ok(()) => {
            debug!("Memory locked");
            Ok(true)
        }
        Err(nix::errno::Errno::EPERM) => {
            warn!("mlockall failed with EPERM (no CAP_IPC_LOCK); continuing unlocked");
            Ok(false)
        }
        Err(e) => Err(DrkError::Config(format!("mlockall failed: {e}"))),
    }
}

#[cfg(not(target_os = "linux"))]
fn lock_memory() -> DrkResult<bool> {
    warn!("mlockall not available on this platform");
    Ok(false)
}

/// Touch `size` bytes of stack so later frames do not fault.
fn prefault_stack(size: usize) -> usize {
    if size == 0 {
        return 0;
    }
    let faulted = prefault_frames(size, 0);
    debug!(faulted, "Stack pre-faulted");
    faulted
}

#[inline(never)]
fn prefault_frames(remaining: usize, depth: usize) -> usize {
    const FRAME_SIZE: usize = 4096;
    const MAX_DEPTH: usize = 1024;

    if remaining < FRAME_SIZE || depth >= MAX_DEPTH {
        return 0;
    }

    let mut frame = [0u8; FRAME_SIZE];
    // SAFETY: both writes stay inside the local array.
    unsafe {
        std::ptr::write_volatile(frame.as_mut_ptr(), 0xd5);
        std::ptr::write_volatile(frame.as_mut_ptr().add(FRAME_SIZE - 1), 0xd5);
    }
    std::hint::black_box(&frame);

    FRAME_SIZE + prefault_frames(remaining - FRAME_SIZE, depth + 1)
}

/// System page size.
#[must_use]
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(size).unwrap_or(4096)
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

#[cfg(target_os = "linux")]
fn set_scheduler(policy: SchedPolicy, priority: u8) -> DrkResult<(Option<SchedPolicy>, Option<u8>)> {
    let linux_policy = match policy {
        SchedPolicy::Fifo => libc::SCHED_FIFO,
        SchedPolicy::Rr => libc::SCHED_RR,
        SchedPolicy::Other => return Ok((Some(SchedPolicy::Other), None)),
    };

    let clamped = priority.clamp(1, 99);
    if clamped != priority {
        warn!(requested = priority, clamped, "Scheduler priority clamped");
    }

    let param = libc::sched_param {
        sched_priority: i32::from(clamped),
    };
    // SAFETY: pid 0 is the calling thread and `param` outlives the call.
    let result = unsafe { libc::sched_setscheduler(0, linux_policy, &param) };

    if result == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            warn!(?policy, "sched_setscheduler failed with EPERM (no CAP_SYS_NICE)");
            return Ok((None, None));
        }
        return Err(DrkError::Config(format!("sched_setscheduler failed: {err}")));
    }

    info!(?policy, priority = clamped, "Real-time scheduler set");
    Ok((Some(policy), Some(clamped)))
}

#[cfg(not(target_os = "linux"))]
fn set_scheduler(policy: SchedPolicy, priority: u8) -> DrkResult<(Option<SchedPolicy>, Option<u8>)> {
    if policy != SchedPolicy::Other {
        warn!(?policy, priority, "Real-time scheduling not available on this platform");
    }
    Ok((None, None))
}

#[cfg(target_os = "linux")]
fn set_cpu_affinity(affinity: &CpuAffinity) -> DrkResult<Option<Vec<usize>>> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let cpus = match affinity {
        CpuAffinity::None => return Ok(None),
        CpuAffinity::Single(cpu) => vec![*cpu],
        CpuAffinity::Set(cpus) if cpus.is_empty() => return Ok(None),
        CpuAffinity::Set(cpus) => cpus.clone(),
    };

    let mut cpu_set = CpuSet::new();
    for &cpu in &cpus {
        cpu_set
            .set(cpu)
            .map_err(|e| DrkError::Config(format!("invalid CPU index {cpu}: {e}")))?;
    }

    match sched_setaffinity(Pid::from_raw(0), &cpu_set) {
        Ok(()) => {
            info!(?cpus, "Measuring thread pinned");
            Ok(Some(cpus))
        }
        Err(nix::errno::Errno::EINVAL) => Err(DrkError::Config(format!(
            "none of the CPUs {cpus:?} are online"
        ))),
        Err(e) => Err(DrkError::Config(format!("sched_setaffinity failed: {e}"))),
    }
}

#[cfg(not(target_os = "linux"))]
fn set_cpu_affinity(affinity: &CpuAffinity) -> DrkResult<Option<Vec<usize>>> {
    if !matches!(affinity, CpuAffinity::None) {
        warn!("CPU affinity not available on this platform");
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_harmless() {
        let status = prepare_measurement_thread(&RealtimeConfig::default()).unwrap();
        assert!(!status.memory_locked);
        assert!(status.cpu_affinity.is_none());
        assert!(status.scheduler_priority.is_none());
        assert!(status.stack_prefaulted > 0);
    }

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps >= 4096);
        assert!(ps.is_power_of_two());
    }

    #[test]
    fn test_stack_prefault() {
        assert_eq!(prefault_stack(0), 0);
        assert_eq!(prefault_stack(64 * 1024), 64 * 1024);
        assert_eq!(prefault_stack(4095), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_cpu_affinity_none() {
        assert!(set_cpu_affinity(&CpuAffinity::None).unwrap().is_none());
        assert!(set_cpu_affinity(&CpuAffinity::Set(vec![])).unwrap().is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_cpu_affinity_out_of_range() {
        let err = set_cpu_affinity(&CpuAffinity::Single(1 << 20)).unwrap_err();
        assert!(matches!(err, DrkError::Config(_)));
    }
}
