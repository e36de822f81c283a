/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Chip address space layouts.
//!
//! The chip is chosen with one of the mutually exclusive `esp32p4`, `esp32c5`, `esp32c61`
//! features, like a board is chosen for the kernel. The page size can still be overridden at run
//! time with [`PlatformLayout::with_page_size`] because it is a bootloader setting on these chips.

use {
    crate::{
        memory::{Address, MemoryRegion, Virtual},
        mm,
    },
    core::fmt,
};

pub mod esp32c5;
pub mod esp32c61;
pub mod esp32p4;

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Where flash and PSRAM are visible in the virtual address space, and in what page size.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PlatformLayout {
    /// Chip name, for diagnostics.
    pub name: &'static str,
    /// MMU page size in bytes.
    pub page_size: usize,
    /// Inclusive start of the flash virtual window.
    pub flash_vaddr_low: usize,
    /// Exclusive end of the flash virtual window.
    pub flash_vaddr_high: usize,
    /// Inclusive start of the PSRAM virtual window.
    pub psram_vaddr_low: usize,
    /// Exclusive end of the PSRAM virtual window.
    pub psram_vaddr_high: usize,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

cfg_if::cfg_if! {
    if #[cfg(feature = "esp32c5")] {
        pub use self::esp32c5 as current;
    } else if #[cfg(feature = "esp32c61")] {
        pub use self::esp32c61 as current;
    } else {
        pub use self::esp32p4 as current;
    }
}

/// Layout of the chip this crate was built for.
pub const fn layout() -> PlatformLayout {
    current::LAYOUT
}

impl PlatformLayout {
    /// Same layout with another MMU page size.
    pub const fn with_page_size(self, page_size: usize) -> Self {
        Self { page_size, ..self }
    }

    /// Check that all window boundaries are page aligned and the scratch windows fit.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.page_size.is_power_of_two() {
            return Err("MMU page size must be a power of two");
        }
        let bounds = [
            self.flash_vaddr_low,
            self.flash_vaddr_high,
            self.psram_vaddr_low,
            self.psram_vaddr_high,
        ];
        if bounds.iter().any(|b| !mm::is_aligned(*b, self.page_size)) {
            return Err("Virtual window boundaries must be page aligned");
        }
        if self.flash_vaddr_high.saturating_sub(self.flash_vaddr_low) < self.page_size {
            return Err("Flash virtual window is smaller than a page");
        }
        // The scratch page is the second-to-last PSRAM page.
        if self.psram_vaddr_high.saturating_sub(self.psram_vaddr_low) < 2 * self.page_size {
            return Err("PSRAM virtual window is smaller than two pages");
        }
        Ok(())
    }

    /// True if flash and PSRAM are visible through one shared virtual range.
    pub fn shares_vaddr_space(&self) -> bool {
        self.flash_window().overlaps(&self.psram_window())
    }

    /// Whole flash virtual window.
    pub fn flash_window(&self) -> MemoryRegion<Virtual> {
        (self.flash_vaddr_low..self.flash_vaddr_high).into()
    }

    /// Whole PSRAM virtual window.
    pub fn psram_window(&self) -> MemoryRegion<Virtual> {
        (self.psram_vaddr_low..self.psram_vaddr_high).into()
    }

    /// The last page of the flash virtual window. Every flash source page is mapped here in turn
    /// while it is being copied.
    pub const fn flash_end_page_vaddr(&self) -> Address<Virtual> {
        Address::new(self.flash_vaddr_high - self.page_size)
    }

    /// The second-to-last page of the PSRAM virtual window. Used as a writable stand-in for the
    /// destination once the final destination range is no longer writable.
    ///
    /// Not the last page, which on shared-space chips is the flash end page.
    pub const fn psram_scratch_vaddr(&self) -> Address<Virtual> {
        Address::new(self.psram_vaddr_high - 2 * self.page_size)
    }

    /// Convert a count of MMU pages into bytes.
    pub const fn pages_to_bytes(&self, pages: usize) -> usize {
        pages * self.page_size
    }

    /// Convert bytes into the number of MMU pages needed to hold them.
    pub const fn bytes_to_pages(&self, bytes: usize) -> usize {
        mm::pages_for(bytes, self.page_size)
    }
}

impl fmt::Display for PlatformLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (page, unit) = mm::size_human_readable_ceil(self.page_size);
        write!(
            f,
            "{}: {} {} pages, flash {}, psram {}",
            self.name,
            page,
            unit,
            self.flash_window(),
            self.psram_window()
        )
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p4_windows_are_separate() {
        let layout = esp32p4::LAYOUT;
        assert!(layout.validate().is_ok());
        assert!(!layout.shares_vaddr_space());
        assert_eq!(layout.flash_end_page_vaddr().as_usize(), 0x43ff_0000);
        assert_eq!(layout.psram_scratch_vaddr().as_usize(), 0x4bfe_0000);
    }

    #[test]
    fn shared_space_scratch_does_not_hit_flash_window() {
        for layout in [esp32c5::LAYOUT, esp32c61::LAYOUT] {
            assert!(layout.validate().is_ok());
            assert!(layout.shares_vaddr_space());
            assert_ne!(layout.flash_end_page_vaddr(), layout.psram_scratch_vaddr());
            assert_eq!(
                layout.flash_end_page_vaddr() - layout.psram_scratch_vaddr(),
                layout.page_size
            );
        }
    }

    #[test]
    fn page_size_override() {
        let layout = esp32p4::LAYOUT.with_page_size(0x8000);
        assert!(layout.validate().is_ok());
        assert_eq!(layout.psram_scratch_vaddr().as_usize(), 0x4bff_0000);
        assert_eq!(layout.bytes_to_pages(0x8001), 2);
        assert_eq!(layout.pages_to_bytes(3), 0x1_8000);
    }

    #[test]
    fn bad_layouts_are_rejected() {
        assert!(esp32p4::LAYOUT.with_page_size(0x3000).validate().is_err());
        let tiny = PlatformLayout {
            psram_vaddr_high: esp32p4::LAYOUT.psram_vaddr_low + 0x1_0000,
            ..esp32p4::LAYOUT
        };
        assert_eq!(
            tiny.validate(),
            Err("PSRAM virtual window is smaller than two pages")
        );
        let unaligned = PlatformLayout {
            flash_vaddr_high: 0x43ff_f000,
            ..esp32p4::LAYOUT
        };
        assert!(unaligned.validate().is_err());
    }
}
