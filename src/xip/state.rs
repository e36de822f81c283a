/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Frozen relocation results and the queries answered from them.

use {
    super::{GapRange, SegmentBounds, SegmentKind, NOT_FOUND},
    crate::{
        memory::{
            mmu::{interface::AddressTranslator, MmuId, MmuTarget},
            Address, MemoryRegion, Physical, Virtual,
        },
        platform::PlatformLayout,
    },
    log::info,
    once_cell::race::OnceRef,
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Where one relocated segment came from and where it went.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SegmentDescriptor {
    kind: SegmentKind,
    vaddr_start: Address<Virtual>,
    size: usize,
    paddr_offset: isize,
    flash_paddr_start: Address<Physical>,
    psram_paddr_start: Address<Physical>,
}

/// Relocation state after configuration, read-only for the rest of the boot.
#[derive(Clone, Debug)]
pub struct XipState {
    layout: PlatformLayout,
    bounds: [SegmentBounds; 2],
    segments: [Option<SegmentDescriptor>; 2],
}

static PUBLISHED: OnceRef<'static, XipState> = OnceRef::new();

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl SegmentDescriptor {
    pub(crate) fn new(
        kind: SegmentKind,
        vaddr_start: Address<Virtual>,
        size: usize,
        flash_paddr_start: Address<Physical>,
        psram_paddr_start: Address<Physical>,
    ) -> Self {
        let paddr_offset =
            (flash_paddr_start.as_usize() as isize).wrapping_sub(psram_paddr_start.as_usize() as isize);
        Self {
            kind,
            vaddr_start,
            size,
            paddr_offset,
            flash_paddr_start,
            psram_paddr_start,
        }
    }

    /// The segment kind.
    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    /// Page aligned virtual start.
    pub fn vaddr_start(&self) -> Address<Virtual> {
        self.vaddr_start
    }

    /// Size in bytes, a page multiple.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Displacement from a PSRAM physical address of this segment to the same byte in flash,
    /// modulo the address width.
    pub fn paddr_offset(&self) -> isize {
        self.paddr_offset
    }

    /// Page aligned flash physical address the segment was copied from.
    pub fn flash_paddr_start(&self) -> Address<Physical> {
        self.flash_paddr_start
    }

    /// PSRAM physical address the segment was copied to.
    pub fn psram_paddr_start(&self) -> Address<Physical> {
        self.psram_paddr_start
    }

    /// The relocated virtual range.
    pub fn vaddr_region(&self) -> MemoryRegion<Virtual> {
        MemoryRegion::new(self.vaddr_start, self.vaddr_start + self.size)
    }

    /// The PSRAM physical range holding the segment.
    pub fn psram_region(&self) -> MemoryRegion<Physical> {
        MemoryRegion::new(self.psram_paddr_start, self.psram_paddr_start + self.size)
    }
}

impl XipState {
    pub(crate) fn new(
        layout: PlatformLayout,
        bounds: [SegmentBounds; 2],
        segments: [Option<SegmentDescriptor>; 2],
    ) -> Self {
        Self {
            layout,
            bounds,
            segments,
        }
    }

    /// The layout relocation ran with.
    pub fn layout(&self) -> &PlatformLayout {
        &self.layout
    }

    /// Descriptor of a relocated segment, `None` if that kind still runs from flash.
    pub fn descriptor(&self, kind: SegmentKind) -> Option<&SegmentDescriptor> {
        self.segments[kind.index()].as_ref()
    }

    /// Checks if the kind executes from PSRAM.
    pub fn is_relocated(&self, kind: SegmentKind) -> bool {
        self.descriptor(kind).is_some()
    }

    /// Page rounded length of a segment, from its boundary markers.
    pub fn segment_length_for(&self, kind: SegmentKind) -> usize {
        self.bounds[kind.index()].length()
    }

    /// Unused tail of the last page of a segment.
    pub fn alignment_gap_for(&self, kind: SegmentKind) -> GapRange {
        self.bounds[kind.index()].alignment_gap()
    }

    /// Checks if `addr` falls into the page rounded range reserved for `kind`, relocated or not.
    pub fn is_in_relocated_region(&self, addr: Address<Virtual>, kind: SegmentKind) -> bool {
        self.bounds[kind.index()].contains(addr)
    }

    /// Total PSRAM pages taken by relocated segments.
    pub fn pages_used(&self) -> usize {
        self.segments
            .iter()
            .flatten()
            .map(|d| d.size / self.layout.page_size)
            .sum()
    }

    /// Flash physical address backing `vaddr` before relocation.
    ///
    /// Returns `None` if `vaddr` is outside every relocated segment.
    ///
    /// # Panics
    ///
    /// - If a relocated address is not mapped to PSRAM, meaning the MMU was changed behind the
    ///   relocation's back.
    pub fn flash_paddr_of<H>(&self, mmu: &H, vaddr: Address<Virtual>) -> Option<Address<Physical>>
    where
        H: AddressTranslator + ?Sized,
    {
        let segment = SegmentKind::ALL
            .iter()
            .filter_map(|kind| self.descriptor(*kind))
            .find(|d| d.vaddr_region().contains(vaddr))?;

        let (psram_paddr, target) = match mmu.vaddr_to_paddr(MmuId::Psram, vaddr) {
            Some(found) => found,
            None => panic!("Relocated address {} is not mapped", vaddr),
        };
        assert_eq!(
            target,
            MmuTarget::Psram0,
            "Relocated address {} does not resolve to PSRAM",
            vaddr
        );

        Some(psram_paddr.wrapping_add_signed(segment.paddr_offset))
    }

    /// Untyped form of [`XipState::flash_paddr_of`] for raw pointers, [`NOT_FOUND`] for null or
    /// pointers outside every relocated segment.
    pub fn vaddr_to_flash_paddr<H>(&self, mmu: &H, ptr: *const u8) -> usize
    where
        H: AddressTranslator + ?Sized,
    {
        if ptr.is_null() {
            return NOT_FOUND;
        }
        self.flash_paddr_of(mmu, Address::new(ptr as usize))
            .map_or(NOT_FOUND, Address::as_usize)
    }

    /// Log where every segment lives now.
    pub fn print_mappings(&self) {
        info!("XIP on PSRAM, {}", self.layout);
        for kind in SegmentKind::ALL {
            match self.descriptor(kind) {
                Some(d) => info!(
                    "  {: <8} vaddr {} <- psram {} <- flash {:#x}",
                    kind.section_name(),
                    d.vaddr_region(),
                    d.psram_paddr_start(),
                    d.flash_paddr_start().as_usize()
                ),
                None => info!("  {: <8} in flash", kind.section_name()),
            }
        }
    }
}

/// Make `state` reachable through [`published`] for code that cannot be handed a reference,
/// like exception handlers. Works once per process.
pub fn publish(state: &'static XipState) -> Result<(), &'static str> {
    PUBLISHED
        .set(state)
        .map_err(|_| "XIP state is already published")
}

/// The published relocation state, if any.
pub fn published() -> Option<&'static XipState> {
    PUBLISHED.get()
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            memory::mmu::interface::AddressTranslator,
            sim::{fixture, SimSoc, TEST_LAYOUT},
            xip::{RegionConfigurator, WriteProtection, XipConfig, XipSegments},
        },
        alloc::boxed::Box,
    };

    fn relocated(soc: &mut SimSoc) -> XipState {
        let mut configurator = RegionConfigurator::new(
            XipConfig::default(),
            TEST_LAYOUT,
            fixture::markers(),
            fixture::locator(),
        )
        .expect("valid layout");
        unsafe {
            assert_eq!(configurator.configure_instruction_segment(soc, 0, fixture::PSRAM_SIZE), Ok(3));
            assert_eq!(configurator.configure_rodata_segment(soc, 3, fixture::PSRAM_SIZE), Ok(2));
        }
        configurator.finish()
    }

    #[test]
    fn null_and_foreign_pointers_are_not_found() {
        let mut soc = fixture::soc();
        let state = relocated(&mut soc);
        assert_eq!(state.vaddr_to_flash_paddr(&soc, core::ptr::null()), NOT_FOUND);
        assert_eq!(
            state.vaddr_to_flash_paddr(&soc, 0x4800_5000 as *const u8),
            NOT_FOUND
        );
        assert_eq!(state.flash_paddr_of(&soc, Address::new(0x47ff_ffff)), None);
    }

    #[test]
    fn every_relocated_byte_maps_back_to_its_flash_source() {
        let mut soc = fixture::soc();
        let state = relocated(&mut soc);

        for kind in SegmentKind::ALL {
            let d = *state.descriptor(kind).expect("relocated");
            for offset in (0..d.size()).step_by(0x3f7) {
                let vaddr = d.vaddr_start() + offset;
                let flash = state.flash_paddr_of(&soc, vaddr).expect("inside segment");
                assert_eq!(flash, d.flash_paddr_start() + offset);
                assert_eq!(soc.read_virt(vaddr, 1)[0], soc.flash()[flash.as_usize()]);
            }
        }
    }

    #[test]
    fn rodata_offset_is_applied() {
        let mut soc = fixture::soc();
        let state = relocated(&mut soc);
        let d = state.descriptor(SegmentKind::Rodata).expect("relocated");
        assert_eq!(d.psram_paddr_start().as_usize(), 0x3000);
        assert_eq!(d.flash_paddr_start().as_usize(), 0x2_0000);
        assert_eq!(d.paddr_offset(), 0x2_0000 - 0x3000);
        assert_eq!(
            state.vaddr_to_flash_paddr(&soc, 0x4800_3010 as *const u8),
            0x2_0010
        );
    }

    #[test]
    fn instructions_win_when_descriptors_overlap() {
        let soc = {
            let mut soc = fixture::soc();
            unsafe {
                soc.map_region(
                    MmuId::Psram,
                    MmuTarget::Psram0,
                    Address::new(0x4800_0000),
                    Address::new(0),
                    0x1000,
                );
            }
            soc
        };
        let bounds = [
            SegmentBounds::new(0x4800_0000..0x4800_1000, 0x1000),
            SegmentBounds::new(0x4800_0000..0x4800_1000, 0x1000),
        ];
        let state = XipState::new(
            TEST_LAYOUT,
            bounds,
            [
                Some(SegmentDescriptor::new(
                    SegmentKind::Instructions,
                    Address::new(0x4800_0000),
                    0x1000,
                    Address::new(0x1_0000),
                    Address::new(0),
                )),
                Some(SegmentDescriptor::new(
                    SegmentKind::Rodata,
                    Address::new(0x4800_0000),
                    0x1000,
                    Address::new(0x2_0000),
                    Address::new(0),
                )),
            ],
        );
        assert_eq!(
            state.flash_paddr_of(&soc, Address::new(0x4800_0010)),
            Some(Address::new(0x1_0010))
        );
    }

    #[test]
    fn offset_is_applied_modulo_address_width() {
        let mut soc = fixture::soc();
        unsafe {
            soc.map_region(
                MmuId::Psram,
                MmuTarget::Psram0,
                Address::new(0x4800_0000),
                Address::new(0x2_0000),
                0x1000,
            );
        }
        // PSRAM paddr past isize::MAX, the displacement only holds modulo the address width.
        let flash_start = Address::new(0x1000);
        let psram_start = Address::new((isize::MAX as usize) + 0x1001);
        let descriptor = SegmentDescriptor::new(
            SegmentKind::Instructions,
            Address::new(0x4800_0000),
            0x1000,
            flash_start,
            psram_start,
        );
        assert_eq!(
            psram_start.wrapping_add_signed(descriptor.paddr_offset()),
            flash_start
        );

        let state = XipState::new(
            TEST_LAYOUT,
            [
                SegmentBounds::new(0x4800_0000..0x4800_1000, 0x1000),
                SegmentBounds::new(0x4800_1000..0x4800_1000, 0x1000),
            ],
            [Some(descriptor), None],
        );
        let expected = 0x2_0010usize.wrapping_add_signed(descriptor.paddr_offset());
        assert_eq!(
            state.vaddr_to_flash_paddr(&soc, 0x4800_0010 as *const u8),
            expected
        );
        assert_ne!(expected, NOT_FOUND);
    }

    #[test]
    fn queries_work_without_configuration() {
        let configurator = RegionConfigurator::new(
            XipConfig::new(XipSegments::empty(), WriteProtection::NotYetEnforced),
            TEST_LAYOUT,
            fixture::markers(),
            fixture::locator(),
        )
        .expect("valid layout");
        let state = configurator.finish();
        let soc = fixture::soc();

        assert_eq!(state.segment_length_for(SegmentKind::Instructions), 0x3000);
        assert_eq!(state.segment_length_for(SegmentKind::Rodata), 0x2000);
        assert!(state.is_in_relocated_region(Address::new(0x4800_2fff), SegmentKind::Instructions));
        assert!(!state.is_in_relocated_region(Address::new(0x4800_3000), SegmentKind::Instructions));
        assert_eq!(
            state.alignment_gap_for(SegmentKind::Rodata),
            GapRange {
                start: 0x4800_5000,
                end: 0x4800_5000
            }
        );
        assert_eq!(state.pages_used(), 0);
        assert_eq!(state.flash_paddr_of(&soc, Address::new(0x4800_0000)), None);
    }

    #[test]
    #[should_panic(expected = "does not resolve to PSRAM")]
    fn remapped_to_flash_is_fatal() {
        let mut soc = fixture::soc();
        let state = relocated(&mut soc);
        unsafe {
            soc.map_region(
                MmuId::Psram,
                MmuTarget::Flash0,
                Address::new(0x4800_0000),
                Address::new(0x1_0000),
                0x1000,
            );
        }
        state.flash_paddr_of(&soc, Address::new(0x4800_0004));
    }

    #[test]
    fn publish_only_once() {
        let mut soc = fixture::soc();
        let state: &'static XipState = Box::leak(Box::new(relocated(&mut soc)));

        assert!(publish(state).is_ok());
        assert!(core::ptr::eq(published().expect("published"), state));
        assert!(publish(state).is_err());
        assert_eq!(published().map(XipState::pages_used), Some(5));
    }
}
