/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! ESP32-P4: separate flash and PSRAM virtual windows, each with its own MMU.

use {
    super::PlatformLayout,
    crate::{memory::mmu::Granule64KiB, mm},
    static_assertions::const_assert,
};

/// The chip's virtual memory map.
#[rustfmt::skip]
pub mod map {
    /// Flash virtual window.
    pub const FLASH_VADDR_LOW:  usize = 0x4000_0000;
    /// Exclusive end of the flash virtual window.
    pub const FLASH_VADDR_HIGH: usize = 0x4400_0000;
    /// PSRAM virtual window.
    pub const PSRAM_VADDR_LOW:  usize = 0x4800_0000;
    /// Exclusive end of the PSRAM virtual window.
    pub const PSRAM_VADDR_HIGH: usize = 0x4C00_0000;
}

/// Default layout.
pub const LAYOUT: PlatformLayout = PlatformLayout {
    name: "esp32p4",
    page_size: Granule64KiB::SIZE,
    flash_vaddr_low: map::FLASH_VADDR_LOW,
    flash_vaddr_high: map::FLASH_VADDR_HIGH,
    psram_vaddr_low: map::PSRAM_VADDR_LOW,
    psram_vaddr_high: map::PSRAM_VADDR_HIGH,
};

const_assert!(mm::is_aligned(map::FLASH_VADDR_HIGH, Granule64KiB::SIZE));
const_assert!(mm::is_aligned(map::PSRAM_VADDR_HIGH, Granule64KiB::SIZE));
const_assert!(map::FLASH_VADDR_HIGH <= map::PSRAM_VADDR_LOW);
