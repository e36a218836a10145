//! Fenced timestamp-counter reads.
//!
//! `begin` drains earlier memory operations and blocks later instructions
//! from starting before the counter is read. `end` waits for everything
//! before it to retire and keeps later instructions from starting early.
//! Together they bound a measured region without out-of-order skew.

use drk_common::time::CycleCount;

/// Snapshot the cycle counter at the start of a measured region.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
#[must_use]
pub fn begin() -> CycleCount {
    let lo: u32;
    let hi: u32;
    // SAFETY: fences and rdtsc only read the TSC; no memory is touched. The
    // missing `nomem` option keeps the compiler from moving accesses across.
    unsafe {
        core::arch::asm!(
            "mfence",
            "lfence",
            "rdtsc",
            "lfence",
            out("eax") lo,
            out("edx") hi,
            options(nostack, preserves_flags),
        );
    }
    CycleCount((u64::from(hi) << 32) | u64::from(lo))
}

/// Snapshot the cycle counter at the end of a measured region.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
#[must_use]
pub fn end() -> CycleCount {
    let lo: u32;
    let hi: u32;
    // SAFETY: rdtscp reads the TSC and IA32_TSC_AUX (discarded in ecx).
    unsafe {
        core::arch::asm!(
            "rdtscp",
            "lfence",
            out("eax") lo,
            out("edx") hi,
            out("ecx") _,
            options(nostack, preserves_flags),
        );
    }
    CycleCount((u64::from(hi) << 32) | u64::from(lo))
}

#[cfg(not(target_arch = "x86_64"))]
fn fallback_now() -> CycleCount {
    use std::sync::OnceLock;
    use std::time::Instant;

    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    let nanos = ORIGIN.get_or_init(Instant::now).elapsed().as_nanos();
    CycleCount(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Monotonic nanoseconds standing in for the TSC on other architectures.
#[cfg(not(target_arch = "x86_64"))]
#[inline]
#[must_use]
pub fn begin() -> CycleCount {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    fallback_now()
}

/// Monotonic nanoseconds standing in for the TSC on other architectures.
#[cfg(not(target_arch = "x86_64"))]
#[inline]
#[must_use]
pub fn end() -> CycleCount {
    let now = fallback_now();
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    now
}

/// Cycles spent running `f`, bracketed by [`begin`] and [`end`].
#[inline(always)]
pub fn measure<F: FnOnce()>(f: F) -> CycleCount {
    let start = begin();
    f();
    end().since(start)
}
