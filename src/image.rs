/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Where the firmware image keeps its segments in flash.

use crate::memory::{Address, Physical};

/// Reports the flash physical start of the rodata and instruction segments of the running image.
///
/// Usually implemented by the bootloader handoff code that parsed the image header.
pub trait ImageSegmentLocator {
    /// Returns `(rodata_flash_paddr, instructions_flash_paddr)`. Not necessarily page aligned.
    fn flash_segment_starts(&self) -> (Address<Physical>, Address<Physical>);
}

/// Segment starts known up front, e.g. passed over from the second stage bootloader.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FlashSegmentStarts {
    /// Flash offset of the read-only data segment.
    pub rodata: Address<Physical>,
    /// Flash offset of the instruction segment.
    pub instructions: Address<Physical>,
}

impl FlashSegmentStarts {
    /// Create an instance.
    pub const fn new(rodata: usize, instructions: usize) -> Self {
        Self {
            rodata: Address::new(rodata),
            instructions: Address::new(instructions),
        }
    }
}

impl ImageSegmentLocator for FlashSegmentStarts {
    fn flash_segment_starts(&self) -> (Address<Physical>, Address<Physical>) {
        (self.rodata, self.instructions)
    }
}
