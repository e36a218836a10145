//! Calibration fixtures.
//!
//! Calibration needs one address of each memory class whose state is known:
//! a mapped executable page, a mapped non-executable page, and an address
//! nothing maps. The executable page is filled with `ud2` so a probe that
//! somehow commits a jump into it still traps instead of running garbage.

use crate::realtime::page_size;
use drk_common::error::{DrkError, DrkResult};
use drk_common::probe::FixtureClass;
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use tracing::{debug, warn};

/// `ud2` (0f 0b) as a little-endian halfword.
const UD2: u16 = 0x0b0f;

/// One provisioned calibration address.
///
/// Owns its mapping, if any; the page is unmapped on drop.
#[derive(Debug)]
pub struct MemoryFixture {
    class: FixtureClass,
    address: u64,
    mapping: Option<(NonNull<c_void>, usize)>,
}

impl MemoryFixture {
    /// Provision a fixture of `class`.
    ///
    /// `unmapped_address` is used verbatim for [`FixtureClass::Unmapped`];
    /// nothing checks that it is actually unmapped.
    ///
    /// # Errors
    ///
    /// Returns [`DrkError::Fixture`] if the page cannot be mapped.
    pub fn provision(class: FixtureClass, unmapped_address: u64) -> DrkResult<Self> {
        let fixture = match class {
            FixtureClass::Executable => Self::map_page(
                class,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
            )?,
            FixtureClass::NonExecutable => Self::map_page(class, ProtFlags::PROT_READ)?,
            FixtureClass::Unmapped => Self {
                class,
                address: unmapped_address,
                mapping: None,
            },
        };
        debug!(%class, address = format_args!("{:#x}", fixture.address), "Fixture provisioned");
        Ok(fixture)
    }

    fn map_page(class: FixtureClass, prot: ProtFlags) -> DrkResult<Self> {
        let len = page_size();
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| DrkError::Fixture("page size reported as zero".into()))?;

        // SAFETY: anonymous private mapping at a kernel-chosen address; no
        // existing memory is aliased.
        let ptr = unsafe { mmap_anonymous(None, length, prot, MapFlags::MAP_PRIVATE) }
            .map_err(|e| DrkError::Fixture(format!("mmap for {class} fixture failed: {e}")))?;

        let fixture = Self {
            class,
            address: ptr.as_ptr() as u64,
            mapping: Some((ptr, len)),
        };

        if prot.contains(ProtFlags::PROT_WRITE) {
            // SAFETY: the mapping is writable, page aligned and `len` bytes long.
            let words = unsafe {
                std::slice::from_raw_parts_mut(ptr.as_ptr().cast::<u16>(), len / 2)
            };
            words.fill(UD2);
        } else {
            // Populate the page-table entry.
            // SAFETY: the mapping is readable and at least one byte long.
            unsafe { std::ptr::read_volatile(ptr.as_ptr().cast::<u8>()) };
        }

        Ok(fixture)
    }

    /// Memory class of this fixture.
    #[must_use]
    pub fn class(&self) -> FixtureClass {
        self.class
    }

    /// Address to probe.
    #[must_use]
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Whether this fixture owns a live mapping.
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }
}

impl Drop for MemoryFixture {
    fn drop(&mut self) {
        if let Some((ptr, len)) = self.mapping.take() {
            // SAFETY: `ptr`/`len` came from our own mmap and nothing else
            // holds references into the page.
            if let Err(e) = unsafe { munmap(ptr, len) } {
                warn!(class = %self.class, error = %e, "munmap of fixture failed");
            }
        }
    }
}

/// The three calibration fixtures.
#[derive(Debug)]
pub struct FixtureSet {
    /// Mapped executable page.
    pub executable: MemoryFixture,
    /// Mapped read-only page.
    pub non_executable: MemoryFixture,
    /// Unmapped placeholder address.
    pub unmapped: MemoryFixture,
}

impl FixtureSet {
    /// Provision all three fixtures.
    ///
    /// # Errors
    ///
    /// Returns the first [`DrkError::Fixture`]; pages already mapped are
    /// released.
    pub fn provision_all(unmapped_address: u64) -> DrkResult<Self> {
        Ok(Self {
            executable: MemoryFixture::provision(FixtureClass::Executable, unmapped_address)?,
            non_executable: MemoryFixture::provision(FixtureClass::NonExecutable, unmapped_address)?,
            unmapped: MemoryFixture::provision(FixtureClass::Unmapped, unmapped_address)?,
        })
    }

    /// Fixture of the given class.
    #[must_use]
    pub fn get(&self, class: FixtureClass) -> &MemoryFixture {
        match class {
            FixtureClass::Executable => &self.executable,
            FixtureClass::NonExecutable => &self.non_executable,
            FixtureClass::Unmapped => &self.unmapped,
        }
    }
}
