/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! ESP32-C61: same shared window arrangement as the C5.

use {
    super::PlatformLayout,
    crate::{memory::mmu::Granule64KiB, mm},
    static_assertions::const_assert,
};

/// The chip's virtual memory map.
#[rustfmt::skip]
pub mod map {
    /// Shared external memory virtual window.
    pub const EXT_VADDR_LOW:  usize = 0x4200_0000;
    /// Exclusive end of the shared window.
    pub const EXT_VADDR_HIGH: usize = 0x4400_0000;
}

/// Default layout.
pub const LAYOUT: PlatformLayout = PlatformLayout {
    name: "esp32c61",
    page_size: Granule64KiB::SIZE,
    flash_vaddr_low: map::EXT_VADDR_LOW,
    flash_vaddr_high: map::EXT_VADDR_HIGH,
    psram_vaddr_low: map::EXT_VADDR_LOW,
    psram_vaddr_high: map::EXT_VADDR_HIGH,
};

const_assert!(mm::is_aligned(map::EXT_VADDR_HIGH, Granule64KiB::SIZE));
