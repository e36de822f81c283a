/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Page-by-page flash to PSRAM copy engine.
//!
//! The flash contents are read through a single flash window, the last page of the flash virtual
//! range, which is re-pointed at every source page in turn. The destination is written either at
//! its final virtual address, or, when that address is no longer writable, through a scratch
//! window which is re-pointed the same way.
//!
//! ```text
//!  flash paddr          flash window vaddr        psram window vaddr       psram paddr
//! +-----------+  map   +------------------+ copy +------------------+ map +-----------+
//! |  page n   | -----> | flash_end_page   | ---> | target or scratch| <-- |  page n   |
//! +-----------+        +------------------+      +------------------+     +-----------+
//!                                                         | (scratch only)
//!                                                         v writeback, re-map at target
//! ```

use {
    super::WriteProtection,
    crate::{
        memory::{
            mmu::{interface::XipHal, MmuId, MmuTarget},
            Address, MemoryRegion, Physical, Virtual,
        },
        mm,
        platform::PlatformLayout,
    },
    log::trace,
};

/// Moves whole pages from flash into PSRAM, keeping a given virtual address for them.
pub struct SegmentRelocator<'hal, H: XipHal> {
    hal: &'hal mut H,
    layout: PlatformLayout,
    write_protection: WriteProtection,
}

impl<'hal, H: XipHal> SegmentRelocator<'hal, H> {
    /// Create an instance. The strategy stays the same for every page this relocator moves.
    pub fn new(hal: &'hal mut H, layout: PlatformLayout, write_protection: WriteProtection) -> Self {
        Self {
            hal,
            layout,
            write_protection,
        }
    }

    /// Copy `size` bytes starting at flash physical address `flash_paddr_start` into PSRAM at
    /// `target_paddr_start`, visible at `target_vaddr_start` afterwards.
    ///
    /// The size is processed in whole pages; bytes past `size` in the last page come along
    /// and are meaningless. Returns the number of bytes moved, always `size` rounded up to a
    /// page.
    ///
    /// Both windows end up mapped to the last page moved, whatever they pointed to before is
    /// lost.
    ///
    /// # Safety
    ///
    /// - Re-programs MMU entries for the target range and both windows. Nothing executing or
    ///   being read must live in the target range or the windows while this runs, unless it is
    ///   byte-identical in flash and PSRAM.
    /// - The PSRAM range `[target_paddr_start, target_paddr_start + align_up(size))` must be
    ///   free for this segment.
    ///
    /// # Panics
    ///
    /// - If any address is not page aligned.
    /// - If the target range covers one of the windows.
    /// - If the MMU maps anything but exactly one page for a one-page request.
    pub unsafe fn relocate(
        &mut self,
        flash_paddr_start: Address<Physical>,
        size: usize,
        target_vaddr_start: Address<Virtual>,
        target_paddr_start: Address<Physical>,
    ) -> usize {
        let page_size = self.layout.page_size;
        let flash_window = self.layout.flash_end_page_vaddr();

        trace!(
            "flash_paddr_start: {:#x}, flash_end_page_vaddr: {:#x}, size: {:#x}, target_vaddr_start: {:#x}",
            flash_paddr_start.as_usize(),
            flash_window.as_usize(),
            size,
            target_vaddr_start.as_usize()
        );
        assert!(
            flash_paddr_start.is_aligned(page_size),
            "Flash source not page aligned"
        );
        assert!(
            flash_window.is_aligned(page_size),
            "Flash window not page aligned"
        );
        assert!(
            target_vaddr_start.is_aligned(page_size),
            "Target vaddr not page aligned"
        );
        assert!(
            target_paddr_start.is_aligned(page_size),
            "Target paddr not page aligned"
        );

        let target_region = MemoryRegion::new(
            target_vaddr_start,
            target_vaddr_start + mm::align_up(size, page_size),
        );
        assert!(
            !target_region.contains(flash_window),
            "Target range covers the flash window"
        );
        if self.write_protection == WriteProtection::Enforced {
            assert!(
                !target_region.contains(self.layout.psram_scratch_vaddr()),
                "Target range covers the PSRAM scratch window"
            );
        }

        let mut mapped_size = 0;
        let mut target_vaddr = target_vaddr_start;
        while mapped_size < size {
            self.move_page(
                flash_paddr_start + mapped_size,
                target_vaddr,
                target_paddr_start + mapped_size,
            );

            trace!("target_vaddr_start: {:#x}", target_vaddr.as_usize());
            mapped_size += page_size;
            target_vaddr = target_vaddr + page_size;
        }

        trace!("mapped_size: {:#x}", mapped_size);
        assert_eq!(
            mapped_size,
            mm::align_up(size, page_size),
            "Relocated size is not the page-rounded request"
        );

        mapped_size
    }

    /// Move one page and leave it mapped at `target_vaddr`.
    unsafe fn move_page(
        &mut self,
        flash_paddr: Address<Physical>,
        target_vaddr: Address<Virtual>,
        target_paddr: Address<Physical>,
    ) {
        let page_size = self.layout.page_size;
        let flash_window = self.layout.flash_end_page_vaddr();
        let psram_window = match self.write_protection {
            WriteProtection::NotYetEnforced => target_vaddr,
            WriteProtection::Enforced => self.layout.psram_scratch_vaddr(),
        };

        self.map_one_page(MmuId::Psram, MmuTarget::Psram0, psram_window, target_paddr);
        self.map_one_page(MmuId::Flash, MmuTarget::Flash0, flash_window, flash_paddr);

        self.hal.invalidate_addr(psram_window, page_size);
        self.hal.invalidate_addr(flash_window, page_size);
        self.hal.copy_page(psram_window, flash_window, page_size);

        if self.write_protection == WriteProtection::Enforced {
            self.hal.writeback_addr(psram_window, page_size);
            self.map_one_page(MmuId::Psram, MmuTarget::Psram0, target_vaddr, target_paddr);
            self.hal.invalidate_addr(target_vaddr, page_size);
        }
    }

    unsafe fn map_one_page(
        &mut self,
        mmu: MmuId,
        target: MmuTarget,
        vaddr: Address<Virtual>,
        paddr: Address<Physical>,
    ) {
        let page_size = self.layout.page_size;
        let mapped = self.hal.map_region(mmu, target, vaddr, paddr, page_size);
        assert_eq!(
            mapped, page_size,
            "MMU mapped {:#x} bytes of {} at {:#x} instead of one page",
            mapped, target, vaddr.as_usize()
        );
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------
