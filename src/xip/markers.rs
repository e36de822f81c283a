/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Reserved segment boundaries and the page arithmetic derived from them.

use {
    super::{SegmentKind, GAP_ALIGNMENT},
    crate::{
        memory::{Address, MemoryRegion, Virtual},
        mm,
    },
    core::{fmt, ops::Range},
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Source of the `[start, end)` virtual range reserved for each segment kind.
pub trait BoundaryMarkers {
    /// The reserved range, as laid out by the linker. Not necessarily page aligned.
    fn reserved_range(&self, kind: SegmentKind) -> Range<usize>;
}

/// Boundary markers with values known up front.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FixedMarkers {
    instructions: Range<usize>,
    rodata: Range<usize>,
}

/// Page-granular view of one reserved segment.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SegmentBounds {
    reserved_start: usize,
    reserved_end: usize,
    page_size: usize,
}

/// Slack between the logical end of a segment and its last page boundary, usable as
/// ordinary memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GapRange {
    /// First usable byte, word aligned.
    pub start: usize,
    /// Exclusive end, page aligned.
    pub end: usize,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl FixedMarkers {
    /// Create an instance.
    pub fn new(instructions: Range<usize>, rodata: Range<usize>) -> Self {
        assert!(instructions.start <= instructions.end);
        assert!(rodata.start <= rodata.end);

        Self {
            instructions,
            rodata,
        }
    }
}

impl BoundaryMarkers for FixedMarkers {
    fn reserved_range(&self, kind: SegmentKind) -> Range<usize> {
        match kind {
            SegmentKind::Instructions => self.instructions.clone(),
            SegmentKind::Rodata => self.rodata.clone(),
        }
    }
}

impl<T: BoundaryMarkers + ?Sized> BoundaryMarkers for &T {
    fn reserved_range(&self, kind: SegmentKind) -> Range<usize> {
        (**self).reserved_range(kind)
    }
}

impl SegmentBounds {
    /// Bounds of `kind` as reported by `markers`.
    pub fn of(markers: &impl BoundaryMarkers, kind: SegmentKind, page_size: usize) -> Self {
        Self::new(markers.reserved_range(kind), page_size)
    }

    /// Create an instance.
    pub fn new(reserved: Range<usize>, page_size: usize) -> Self {
        assert!(reserved.start <= reserved.end);
        assert!(page_size.is_power_of_two() && page_size >= GAP_ALIGNMENT);

        Self {
            reserved_start: reserved.start,
            reserved_end: reserved.end,
            page_size,
        }
    }

    /// The range exactly as the linker reserved it.
    pub fn reserved(&self) -> Range<usize> {
        self.reserved_start..self.reserved_end
    }

    /// First virtual address of the relocated range, page aligned.
    pub fn vaddr_start(&self) -> Address<Virtual> {
        Address::new(mm::align_down(self.reserved_start, self.page_size))
    }

    /// Exclusive end of the relocated range, page aligned.
    pub fn vaddr_end_exclusive(&self) -> Address<Virtual> {
        Address::new(mm::align_up(self.reserved_end, self.page_size))
    }

    /// Whole pages covering the reserved range.
    pub fn region(&self) -> MemoryRegion<Virtual> {
        MemoryRegion::new(self.vaddr_start(), self.vaddr_end_exclusive())
    }

    /// Segment length in bytes, a page multiple.
    pub fn length(&self) -> usize {
        self.vaddr_end_exclusive() - self.vaddr_start()
    }

    /// Number of pages the segment occupies.
    pub fn num_pages(&self) -> usize {
        self.length() / self.page_size
    }

    /// The unused tail of the last page.
    pub fn alignment_gap(&self) -> GapRange {
        GapRange {
            start: mm::align_up(self.reserved_end, GAP_ALIGNMENT),
            end: mm::align_up(self.reserved_end, self.page_size),
        }
    }

    /// Checks if the address lies in the page-rounded segment range.
    pub fn contains(&self, addr: Address<Virtual>) -> bool {
        self.region().contains(addr)
    }
}

impl GapRange {
    /// Usable bytes in the gap.
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    /// True if the segment ends on a page boundary and leaves nothing behind.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for GapRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}..{:#010x}", self.start, self.end)
    }
}

//--------------------------------------------------------------------------------------------------
// Linker script symbols
//--------------------------------------------------------------------------------------------------

#[cfg(feature = "linker-symbols")]
mod linker {
    use {
        super::{BoundaryMarkers, SegmentKind},
        core::{cell::UnsafeCell, ops::Range},
    };

    // Symbols from the linker script.
    //
    // The reserved ranges are not page aligned, only the relocation code rounds them. Declared as
    // zero-sized so the compiler cannot assume any alignment of their addresses.
    extern "Rust" {
        static _instruction_reserved_start: UnsafeCell<()>;
        static _instruction_reserved_end: UnsafeCell<()>;
        static _rodata_reserved_start: UnsafeCell<()>;
        static _rodata_reserved_end: UnsafeCell<()>;
    }

    /// Boundary markers of the running firmware, read from linker script symbols.
    #[derive(Copy, Clone, Debug, Default)]
    pub struct LinkerMarkers;

    impl BoundaryMarkers for LinkerMarkers {
        fn reserved_range(&self, kind: SegmentKind) -> Range<usize> {
            // Safety: only the symbol addresses are taken, values are provided by the linker
            // script and must be trusted as-is.
            unsafe {
                match kind {
                    SegmentKind::Instructions => {
                        _instruction_reserved_start.get() as usize
                            .._instruction_reserved_end.get() as usize
                    }
                    SegmentKind::Rodata => {
                        _rodata_reserved_start.get() as usize.._rodata_reserved_end.get() as usize
                    }
                }
            }
        }
    }
}

#[cfg(feature = "linker-symbols")]
pub use linker::LinkerMarkers;

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------
