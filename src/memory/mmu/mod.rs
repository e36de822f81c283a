/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Memory Management Unit and cache interfaces.
//!
//! The relocation code never programs hardware directly. The platform implements the traits in
//! [`interface`] on top of its MMU and cache HAL; tests implement them in memory.

use {
    crate::memory::{Address, Physical, Virtual},
    core::fmt,
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// MMU instance a translation entry belongs to.
///
/// Some chips have a single MMU for both external memories, in that case the platform is free to
/// route both ids to the same table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MmuId {
    /// The MMU serving the flash virtual window.
    Flash,
    /// The MMU serving the PSRAM virtual window.
    Psram,
}

/// Physical memory device a translation entry points into.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MmuTarget {
    /// First flash chip.
    Flash0,
    /// First PSRAM chip.
    Psram0,
}

/// Memory Management interfaces.
pub mod interface {
    use super::*;

    /// Page-granular translation entry programming.
    pub trait AddressTranslator {
        /// Bind `len` bytes at `vaddr` to `paddr` inside `target`, through the `mmu` table.
        ///
        /// Returns the number of bytes actually mapped. Whatever was mapped at `vaddr` before is
        /// replaced.
        ///
        /// # Safety
        ///
        /// - Changes the hardware's global state. The caller must ensure no live code or data is
        ///   reached through `vaddr` while it is being re-pointed.
        unsafe fn map_region(
            &mut self,
            mmu: MmuId,
            target: MmuTarget,
            vaddr: Address<Virtual>,
            paddr: Address<Physical>,
            len: usize,
        ) -> usize;

        /// Reverse lookup of a virtual address through the `mmu` table.
        ///
        /// Returns the physical address and the device it resolves to, or `None` if the page is
        /// not mapped.
        fn vaddr_to_paddr(
            &self,
            mmu: MmuId,
            vaddr: Address<Virtual>,
        ) -> Option<(Address<Physical>, MmuTarget)>;
    }

    /// Cache maintenance by virtual address.
    pub trait CacheController {
        /// Drop cached lines covering `[vaddr, vaddr + len)` so the next access goes to memory.
        ///
        /// # Safety
        ///
        /// - Dirty lines in the range are discarded, not written back.
        unsafe fn invalidate_addr(&mut self, vaddr: Address<Virtual>, len: usize);

        /// Write dirty lines covering `[vaddr, vaddr + len)` back to memory.
        fn writeback_addr(&mut self, vaddr: Address<Virtual>, len: usize);
    }

    /// Bulk copy between two mapped virtual windows.
    pub trait PageCopier {
        /// Copy `len` bytes from `src` to `dst`.
        ///
        /// The default is a plain CPU copy through the data cache.
        ///
        /// # Safety
        ///
        /// - Both windows must be mapped, `dst` must be writable and they must not overlap.
        unsafe fn copy_page(&mut self, dst: Address<Virtual>, src: Address<Virtual>, len: usize) {
            core::ptr::copy_nonoverlapping(
                src.as_usize() as *const u8,
                dst.as_usize() as *mut u8,
                len,
            );
        }
    }

    /// Everything the relocator needs from the platform.
    pub trait XipHal: AddressTranslator + CacheController + PageCopier {}

    impl<T> XipHal for T where T: AddressTranslator + CacheController + PageCopier {}
}

/// Describes the characteristics of a translation granule.
pub struct TranslationGranule<const GRANULE_SIZE: usize>;

/// 64 KiB MMU pages, the default on every supported chip.
pub type Granule64KiB = TranslationGranule<{ 64 * 1024 }>;

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl<const GRANULE_SIZE: usize> TranslationGranule<GRANULE_SIZE> {
    /// The granule's size.
    pub const SIZE: usize = Self::size_checked();

    /// The granule's mask.
    pub const MASK: usize = Self::SIZE - 1;

    /// The granule's shift, aka log2(size).
    pub const SHIFT: usize = Self::SIZE.trailing_zeros() as usize;

    const fn size_checked() -> usize {
        assert!(GRANULE_SIZE.is_power_of_two());

        GRANULE_SIZE
    }
}

impl fmt::Display for MmuTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MmuTarget::Flash0 => write!(f, "flash0"),
            MmuTarget::Psram0 => write!(f, "psram0"),
        }
    }
}
