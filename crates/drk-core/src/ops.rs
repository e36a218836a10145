//! Transactional probe operations.
//!
//! Each operation runs as one inline-assembly block: `xbegin`, the faulting
//! instruction, `xend`, and the abort landing pad. Keeping the fallback
//! label inside the same block means an abort never transfers control into
//! compiler-generated code, and the hardware restores every register except
//! `eax` before resuming there.

use drk_common::probe::ProbeKind;
use static_assertions::const_assert_eq;

/// Status reported when the transaction committed instead of aborting.
///
/// Matches the value `xbegin` leaves in `eax` on entry (`_XBEGIN_STARTED`).
pub const XBEGIN_STARTED: u32 = !0;

// The commit path in `transact` loads this value with a literal immediate.
const_assert_eq!(XBEGIN_STARTED, 0xffff_ffff);

/// Run `kind` against `address` inside an RTM transaction.
///
/// Returns the raw abort status, or [`XBEGIN_STARTED`] if the transaction
/// committed.
///
/// # Safety
///
/// The CPU must support RTM; otherwise `xbegin` raises #UD outside any
/// transaction and the process receives SIGILL. Any side effect of the probe
/// is discarded only when the transaction aborts, so `Call` and `Jmp` must not
/// target mapped code that can run to a commit.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
#[allow(clippy::too_many_lines)]
pub unsafe fn transact(kind: ProbeKind, address: u64) -> u32 {
    use core::arch::asm;

    let status: u32;
    match kind {
        ProbeKind::Call => unsafe {
            // The callee may run and return, so assume it follows the C ABI.
            asm!(
                "xbegin 2f",
                "call {target}",
                "xend",
                "mov eax, 0xffffffff",
                "2:",
                target = in(reg) address,
                out("eax") status,
                clobber_abi("C"),
            );
        },
        ProbeKind::Jmp => unsafe {
            asm!(
                "xbegin 2f",
                "jmp {target}",
                "xend",
                "mov eax, 0xffffffff",
                "2:",
                target = in(reg) address,
                out("eax") status,
                options(nostack),
            );
        },
        ProbeKind::Read => unsafe {
            asm!(
                "xbegin 2f",
                "mov {scratch:e}, dword ptr [{target}]",
                "xend",
                "mov eax, 0xffffffff",
                "2:",
                target = in(reg) address,
                scratch = out(reg) _,
                out("eax") status,
                options(nostack),
            );
        },
        ProbeKind::Write => unsafe {
            asm!(
                "xbegin 2f",
                "mov dword ptr [{target}], 0",
                "xend",
                "mov eax, 0xffffffff",
                "2:",
                target = in(reg) address,
                out("eax") status,
                options(nostack),
            );
        },
        ProbeKind::Illegal => unsafe {
            // c7 c8: mov r/m32, imm32 with reg field 1, undefined
            asm!(
                "xbegin 2f",
                ".byte 0xc7, 0xc8",
                "xend",
                "mov eax, 0xffffffff",
                "2:",
                out("eax") status,
                options(nostack),
            );
        },
        ProbeKind::Ud2 => unsafe {
            asm!(
                "xbegin 2f",
                "ud2",
                "xend",
                "mov eax, 0xffffffff",
                "2:",
                out("eax") status,
                options(nostack),
            );
        },
        ProbeKind::Movdqa => {
            let misaligned = misaligned_vector_address(address);
            unsafe {
                asm!(
                    "xbegin 2f",
                    "movdqa xmm0, xmmword ptr [{target}]",
                    "xend",
                    "mov eax, 0xffffffff",
                    "2:",
                    target = in(reg) misaligned,
                    out("xmm0") _,
                    out("eax") status,
                    options(nostack),
                );
            }
        }
    }
    status
}

/// One byte past the 16-byte boundary below `address`; `movdqa` from it
/// always raises #GP, whatever the page permissions.
#[must_use]
pub fn misaligned_vector_address(address: u64) -> u64 {
    (address & !0xf) | 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_misaligned_vector_address() {
        assert_eq!(misaligned_vector_address(0x1000), 0x1001);
        assert_eq!(misaligned_vector_address(0x100f), 0x1001);
        assert_eq!(misaligned_vector_address(0x1010), 0x1011);
        assert_ne!(misaligned_vector_address(u64::MAX) % 16, 0);
    }

    #[test]
    fn test_committed_marker() {
        assert_eq!(XBEGIN_STARTED, u32::MAX);
    }
}
