/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Boot-time sequencing of the segment relocation.
//!
//! Called once, early, by the single boot core, before the other cores are released and before
//! interrupts are enabled.

use {
    crate::{
        image::ImageSegmentLocator,
        memory::mmu::interface::XipHal,
        xip::{BoundaryMarkers, Error, RegionConfigurator, SegmentKind, XipState},
    },
    log::warn,
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Hands out PSRAM pages for the relocated segments.
pub trait PageAllocator {
    /// First free PSRAM page.
    fn next_free_page(&self) -> usize;

    /// Usable PSRAM size in bytes, counted from physical address zero.
    fn capacity(&self) -> usize;

    /// Mark `pages` pages starting at [`PageAllocator::next_free_page`] as taken.
    fn consume(&mut self, pages: usize);
}

/// Bump allocator over the PSRAM pages.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LinearPageCursor {
    next_page: usize,
    capacity: usize,
}

/// What to do when a segment does not fit into the remaining PSRAM.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutOfSpacePolicy {
    /// Leave the segment in flash and carry on.
    Skip,
    /// Stop and report the error.
    Abort,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl LinearPageCursor {
    /// Create an instance.
    pub const fn new(start_page: usize, capacity: usize) -> Self {
        Self {
            next_page: start_page,
            capacity,
        }
    }
}

impl PageAllocator for LinearPageCursor {
    fn next_free_page(&self) -> usize {
        self.next_page
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn consume(&mut self, pages: usize) {
        self.next_page += pages;
    }
}

/// Move every enabled segment to PSRAM, instructions first, and freeze the result.
///
/// Empty segments are recorded with size 0 and take no pages. A segment that does not fit is
/// handled according to `policy`, any other failure is returned.
///
/// # Safety
///
/// - See [`RegionConfigurator::configure`].
pub unsafe fn relocate_to_psram<H, M, L, A>(
    hal: &mut H,
    mut configurator: RegionConfigurator<M, L>,
    allocator: &mut A,
    policy: OutOfSpacePolicy,
) -> Result<XipState, Error>
where
    H: XipHal,
    M: BoundaryMarkers,
    L: ImageSegmentLocator,
    A: PageAllocator + ?Sized,
{
    for kind in SegmentKind::ALL {
        if !configurator.config().is_enabled(kind) {
            continue;
        }

        match configurator.configure(hal, kind, allocator.next_free_page(), allocator.capacity()) {
            Ok(pages) => allocator.consume(pages),
            Err(e @ Error::OutOfSpace { .. }) if policy == OutOfSpacePolicy::Skip => {
                warn!("{}, {} stays in flash", e, kind.section_name())
            }
            Err(e) => return Err(e),
        }
    }

    let state = configurator.finish();
    state.print_mappings();
    Ok(state)
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            image::FlashSegmentStarts,
            memory::{
                mmu::{MmuId, MmuTarget},
                Address,
            },
            sim::{fixture, HalOp, TEST_LAYOUT},
            xip::{FixedMarkers, WriteProtection, XipConfig, XipSegments},
        },
    };

    const PAGE: usize = 0x1000;

    fn configurator(config: XipConfig) -> RegionConfigurator<FixedMarkers, FlashSegmentStarts> {
        RegionConfigurator::new(config, TEST_LAYOUT, fixture::markers(), fixture::locator())
            .expect("valid layout")
    }

    #[test]
    fn instructions_go_first_and_cursor_advances() {
        let mut soc = fixture::soc();
        let mut cursor = LinearPageCursor::new(4, fixture::PSRAM_SIZE);

        let state = unsafe {
            relocate_to_psram(
                &mut soc,
                configurator(XipConfig::default()),
                &mut cursor,
                OutOfSpacePolicy::Abort,
            )
        }
        .expect("both fit");

        assert_eq!(cursor.next_free_page(), 4 + 3 + 2);
        assert_eq!(state.pages_used(), 5);

        let instructions = state.descriptor(SegmentKind::Instructions).expect("relocated");
        let rodata = state.descriptor(SegmentKind::Rodata).expect("relocated");
        assert_eq!(instructions.psram_paddr_start().as_usize(), 4 * PAGE);
        assert_eq!(rodata.psram_paddr_start().as_usize(), 7 * PAGE);

        let first_psram_map = soc.ops().iter().find_map(|op| match op {
            HalOp::Map {
                mmu: MmuId::Psram,
                target: MmuTarget::Psram0,
                paddr,
                ..
            } => Some(*paddr),
            _ => None,
        });
        assert_eq!(first_psram_map, Some(Address::new(4 * PAGE)));
    }

    #[test]
    fn segment_that_does_not_fit_is_skipped() {
        let mut soc = fixture::soc();
        let mut cursor = LinearPageCursor::new(0, 4 * PAGE);

        let state = unsafe {
            relocate_to_psram(
                &mut soc,
                configurator(XipConfig::default()),
                &mut cursor,
                OutOfSpacePolicy::Skip,
            )
        }
        .expect("skip keeps going");

        assert!(state.is_relocated(SegmentKind::Instructions));
        assert!(!state.is_relocated(SegmentKind::Rodata));
        assert_eq!(cursor.next_free_page(), 3);
    }

    #[test]
    fn abort_reports_out_of_space() {
        let mut soc = fixture::soc();
        let mut cursor = LinearPageCursor::new(0, 4 * PAGE);

        let result = unsafe {
            relocate_to_psram(
                &mut soc,
                configurator(XipConfig::default()),
                &mut cursor,
                OutOfSpacePolicy::Abort,
            )
        };

        assert_eq!(
            result.map(|state| state.pages_used()),
            Err(Error::OutOfSpace {
                kind: SegmentKind::Rodata,
                required: 2 * PAGE,
                start: 3 * PAGE,
                end: 5 * PAGE,
                capacity: 4 * PAGE,
            })
        );
    }

    #[test]
    fn disabled_kinds_are_skipped_silently() {
        let mut soc = fixture::soc();
        let mut cursor = LinearPageCursor::new(0, fixture::PSRAM_SIZE);
        let config = XipConfig::new(XipSegments::RODATA, WriteProtection::Enforced);

        let state = unsafe {
            relocate_to_psram(&mut soc, configurator(config), &mut cursor, OutOfSpacePolicy::Abort)
        }
        .expect("rodata fits");

        assert!(!state.is_relocated(SegmentKind::Instructions));
        assert_eq!(
            state
                .descriptor(SegmentKind::Rodata)
                .map(|d| d.psram_paddr_start().as_usize()),
            Some(0)
        );
        assert_eq!(cursor.next_free_page(), 2);
    }

    #[test]
    fn empty_segment_does_not_stop_the_boot() {
        let mut soc = fixture::soc();
        let mut cursor = LinearPageCursor::new(0, fixture::PSRAM_SIZE);
        let markers = FixedMarkers::new(fixture::INSTRUCTIONS, 0x4800_3000..0x4800_3000);
        let configurator = RegionConfigurator::new(
            XipConfig::default(),
            TEST_LAYOUT,
            markers,
            fixture::locator(),
        )
        .expect("valid layout");

        let state = unsafe {
            relocate_to_psram(&mut soc, configurator, &mut cursor, OutOfSpacePolicy::Abort)
        }
        .expect("empty rodata is not an error");

        assert!(state.is_relocated(SegmentKind::Instructions));
        assert_eq!(
            state.descriptor(SegmentKind::Rodata).map(|d| d.size()),
            Some(0)
        );
        assert_eq!(cursor.next_free_page(), 3);
        assert_eq!(state.pages_used(), 3);
    }
}
