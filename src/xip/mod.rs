/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Flash to PSRAM segment relocation.
//!
//! [`RegionConfigurator`] sizes each reserved segment from its linker boundary markers, checks
//! it fits in the PSRAM space offered by the caller and drives [`SegmentRelocator`] over it.
//! Once both segment kinds went through, the configurator is frozen into an [`XipState`] which
//! answers address queries for the rest of the process lifetime.

use {
    bitflags::bitflags,
    core::fmt,
    snafu::Snafu,
};

mod configurator;
mod markers;
mod relocator;
mod state;

pub use {
    configurator::RegionConfigurator,
    markers::{BoundaryMarkers, FixedMarkers, GapRange, SegmentBounds},
    relocator::SegmentRelocator,
    state::{publish, published, SegmentDescriptor, XipState},
};

#[cfg(feature = "linker-symbols")]
pub use markers::LinkerMarkers;

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Returned by address queries for pointers outside every relocated segment.
pub const NOT_FOUND: usize = usize::MAX;

/// Alignment of the first usable byte after a relocated segment. Heap memory is handed out in
/// words, so at most three bytes past the segment end are lost.
pub const GAP_ALIGNMENT: usize = 4;

/// The image segments that can be moved to PSRAM.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum SegmentKind {
    /// Executable code, `.text` and friends.
    Instructions,
    /// Read-only data, `.rodata` and friends.
    Rodata,
}

bitflags! {
    /// Segment kinds selected for relocation.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct XipSegments: u8 {
        /// Fetch instructions from PSRAM.
        const INSTRUCTIONS = 1 << 0;
        /// Read rodata from PSRAM.
        const RODATA = 1 << 1;
    }
}

/// Whether the final segment address range still accepts stores while relocating.
///
/// Decided once per boot. The physical memory protection split between code and data is a
/// one-way transition, so this cannot change for the lifetime of a [`RegionConfigurator`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WriteProtection {
    /// PSRAM was brought up early, before the protection split. Pages are copied straight into
    /// their final virtual addresses.
    NotYetEnforced,
    /// The segment ranges are already read-only or execute-only. Pages are copied through a
    /// writable scratch window and then re-mapped at their final address.
    Enforced,
}

/// Runtime switches replacing the build-time knobs of the bootloader.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct XipConfig {
    /// Which segments to move.
    pub segments: XipSegments,
    /// How the relocator may write the destination.
    pub write_protection: WriteProtection,
}

/// Reported relocation failures. Broken platform contracts are not reported, they panic.
#[allow(missing_docs)]
#[derive(Debug, Snafu, Eq, PartialEq)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display(
        "PSRAM space not enough for the flash {kind}, need {required} B, from {start} B to {end} B, have {capacity} B"
    ))]
    OutOfSpace {
        kind: SegmentKind,
        required: usize,
        start: usize,
        end: usize,
        capacity: usize,
    },
    #[snafu(display("Relocation of {kind} is not enabled"))]
    Disabled { kind: SegmentKind },
    #[snafu(display("The {kind} segment is already relocated"))]
    AlreadyConfigured { kind: SegmentKind },
    #[snafu(display("PSRAM range of the {kind} segment overlaps the {other} segment"))]
    Overlap {
        kind: SegmentKind,
        other: SegmentKind,
    },
    #[snafu(display("Invalid platform layout: {reason}"))]
    InvalidLayout { reason: &'static str },
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl SegmentKind {
    /// All kinds, in the order they are configured and queried.
    pub const ALL: [SegmentKind; 2] = [SegmentKind::Instructions, SegmentKind::Rodata];

    /// Slot of this kind in per-kind tables.
    pub const fn index(self) -> usize {
        match self {
            SegmentKind::Instructions => 0,
            SegmentKind::Rodata => 1,
        }
    }

    /// The matching configuration flag.
    pub const fn flag(self) -> XipSegments {
        match self {
            SegmentKind::Instructions => XipSegments::INSTRUCTIONS,
            SegmentKind::Rodata => XipSegments::RODATA,
        }
    }

    /// Output section name, for log messages.
    pub const fn section_name(self) -> &'static str {
        match self {
            SegmentKind::Instructions => ".text",
            SegmentKind::Rodata => ".rodata",
        }
    }
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentKind::Instructions => write!(f, "instructions"),
            SegmentKind::Rodata => write!(f, "rodata"),
        }
    }
}

impl XipConfig {
    /// Create an instance.
    pub const fn new(segments: XipSegments, write_protection: WriteProtection) -> Self {
        Self {
            segments,
            write_protection,
        }
    }

    /// Checks if the segment kind is selected for relocation.
    pub fn is_enabled(&self, kind: SegmentKind) -> bool {
        self.segments.contains(kind.flag())
    }
}

impl Default for XipConfig {
    /// Both segments, copied early before the protection split.
    fn default() -> Self {
        Self::new(XipSegments::all(), WriteProtection::NotYetEnforced)
    }
}
