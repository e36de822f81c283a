/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

use {
    super::{
        AlreadyConfiguredSnafu, BoundaryMarkers, DisabledSnafu, Error, GapRange, InvalidLayoutSnafu,
        OutOfSpaceSnafu, OverlapSnafu, SegmentBounds, SegmentDescriptor, SegmentKind, SegmentRelocator,
        XipConfig, XipState,
    },
    crate::{
        image::ImageSegmentLocator,
        memory::{mmu::interface::XipHal, Address, MemoryRegion, Physical, Virtual},
        platform::PlatformLayout,
    },
    log::{debug, error, info},
    snafu::ensure,
};

/// Relocates the image segments one kind at a time and records where they went.
///
/// Every kind can be configured once. [`RegionConfigurator::finish`] consumes the configurator,
/// so nothing can be relocated after the state was frozen.
pub struct RegionConfigurator<M: BoundaryMarkers, L: ImageSegmentLocator> {
    config: XipConfig,
    layout: PlatformLayout,
    markers: M,
    locator: L,
    segments: [Option<SegmentDescriptor>; 2],
}

impl<M: BoundaryMarkers, L: ImageSegmentLocator> RegionConfigurator<M, L> {
    /// Create an instance. The layout is checked here, once.
    pub fn new(config: XipConfig, layout: PlatformLayout, markers: M, locator: L) -> Result<Self, Error> {
        if let Err(reason) = layout.validate() {
            return InvalidLayoutSnafu { reason }.fail();
        }

        Ok(Self {
            config,
            layout,
            markers,
            locator,
            segments: [None, None],
        })
    }

    /// The runtime switches this configurator was created with.
    pub fn config(&self) -> &XipConfig {
        &self.config
    }

    /// The platform layout in use.
    pub fn layout(&self) -> &PlatformLayout {
        &self.layout
    }

    /// Descriptor of an already relocated kind.
    pub fn descriptor(&self, kind: SegmentKind) -> Option<&SegmentDescriptor> {
        self.segments[kind.index()].as_ref()
    }

    fn bounds(&self, kind: SegmentKind) -> SegmentBounds {
        SegmentBounds::of(&self.markers, kind, self.layout.page_size)
    }

    fn flash_start(&self, kind: SegmentKind) -> Address<Physical> {
        let (rodata, instructions) = self.locator.flash_segment_starts();
        match kind {
            SegmentKind::Instructions => instructions,
            SegmentKind::Rodata => rodata,
        }
    }

    /// Page rounded length of a segment, from its boundary markers.
    pub fn segment_length_for(&self, kind: SegmentKind) -> usize {
        self.bounds(kind).length()
    }

    /// Unused tail of the last page of a segment.
    pub fn alignment_gap_for(&self, kind: SegmentKind) -> GapRange {
        self.bounds(kind).alignment_gap()
    }

    /// Checks if `addr` falls into the page rounded range reserved for `kind`.
    pub fn is_in_relocated_region(&self, addr: Address<Virtual>, kind: SegmentKind) -> bool {
        self.bounds(kind).contains(addr)
    }

    /// Copy the `kind` segment into PSRAM starting at page `start_page` and switch its virtual
    /// range over to the copy.
    ///
    /// `psram_size` is the usable PSRAM size in bytes, counted from physical address zero.
    /// Returns the number of PSRAM pages now taken by the segment. An empty segment takes none
    /// and is recorded with size 0.
    ///
    /// Nothing is touched when an error is returned.
    ///
    /// # Safety
    ///
    /// - Re-programs the MMU entries of the whole segment. Code running from the segment must
    ///   tolerate that, which holds while flash and PSRAM contents are identical.
    /// - The PSRAM pages handed in must not be used by anything else.
    pub unsafe fn configure<H: XipHal>(
        &mut self,
        hal: &mut H,
        kind: SegmentKind,
        start_page: usize,
        psram_size: usize,
    ) -> Result<usize, Error> {
        ensure!(self.config.is_enabled(kind), DisabledSnafu { kind });
        ensure!(
            self.segments[kind.index()].is_none(),
            AlreadyConfiguredSnafu { kind }
        );

        let page_size = self.layout.page_size;
        let bounds = self.bounds(kind);
        let size = bounds.length();

        let flash_paddr_start = self.flash_start(kind).align_down(page_size);

        let start = start_page.checked_mul(page_size);
        let end = start.and_then(|start| start.checked_add(size));
        let Some((psram_start, psram_end)) = start.zip(end).filter(|(_, end)| *end <= psram_size)
        else {
            let start = start.unwrap_or(usize::MAX);
            let end = end.unwrap_or(usize::MAX);
            error!(
                "PSRAM space not enough for the flash {}, need {} B, from {} B to {} B",
                kind, size, start, end
            );
            return OutOfSpaceSnafu {
                kind,
                required: size,
                start,
                end,
                capacity: psram_size,
            }
            .fail();
        };

        let psram_region: MemoryRegion<Physical> = (psram_start..psram_end).into();
        for other in self.segments.iter().flatten() {
            ensure!(
                !other.psram_region().overlaps(&psram_region),
                OverlapSnafu {
                    kind,
                    other: other.kind()
                }
            );
        }

        let vaddr_start = bounds.vaddr_start();
        let descriptor = SegmentDescriptor::new(
            kind,
            vaddr_start,
            size,
            flash_paddr_start,
            Address::new(psram_start),
        );
        debug!(
            "{} flash_paddr_start: {:#x}, psram_paddr_start: {:#x}, paddr_offset: {:#x}, vaddr_start: {:#x}",
            kind,
            flash_paddr_start.as_usize(),
            psram_start,
            descriptor.paddr_offset(),
            vaddr_start.as_usize()
        );

        let mapped_size = SegmentRelocator::new(&mut *hal, self.layout, self.config.write_protection)
            .relocate(flash_paddr_start, size, vaddr_start, Address::new(psram_start));
        hal.writeback_addr(vaddr_start, size);

        debug!(
            "after mapping {}, starting from paddr={:#010x} and vaddr={:#010x}, {:#x} bytes are mapped",
            kind,
            psram_start,
            vaddr_start.as_usize(),
            mapped_size
        );
        assert_eq!(mapped_size, size, "Relocated {} size mismatch", kind);

        self.segments[kind.index()] = Some(descriptor);
        info!("{} xip on psram", kind.section_name());

        Ok(size / page_size)
    }

    /// [`RegionConfigurator::configure`] for the instruction segment.
    ///
    /// # Safety
    ///
    /// See [`RegionConfigurator::configure`].
    pub unsafe fn configure_instruction_segment<H: XipHal>(
        &mut self,
        hal: &mut H,
        start_page: usize,
        psram_size: usize,
    ) -> Result<usize, Error> {
        self.configure(hal, SegmentKind::Instructions, start_page, psram_size)
    }

    /// [`RegionConfigurator::configure`] for the read-only data segment.
    ///
    /// # Safety
    ///
    /// See [`RegionConfigurator::configure`].
    pub unsafe fn configure_rodata_segment<H: XipHal>(
        &mut self,
        hal: &mut H,
        start_page: usize,
        psram_size: usize,
    ) -> Result<usize, Error> {
        self.configure(hal, SegmentKind::Rodata, start_page, psram_size)
    }

    /// Freeze the results.
    pub fn finish(self) -> XipState {
        let bounds = SegmentKind::ALL.map(|kind| self.bounds(kind));
        XipState::new(self.layout, bounds, self.segments)
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------
