/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Execute-in-place from PSRAM.
//!
//! At boot, the instruction and read-only data segments of the firmware image are copied page by
//! page from flash into PSRAM and the MMU is re-pointed so that the very same virtual addresses
//! are now backed by PSRAM. Nothing gets relinked, no pointer is rewritten.
//!
//! The crate does not touch the hardware by itself. MMU entries, cache maintenance and image
//! parsing are supplied by the platform through the traits in [`memory::mmu::interface`] and
//! [`image`]. An in-memory SoC model lives in [`sim`] (feature `sim`, always on in tests).
//!
//! Typical boot flow:
//!
//! ```text
//! RegionConfigurator::new(config, layout, markers, locator)
//!     -> boot::relocate_to_psram(hal, configurator, cursor, policy)
//!     -> XipState (frozen, read-only)
//!     -> XipState::vaddr_to_flash_paddr(ptr) from fault handlers, OTA code etc.
//! ```

#![cfg_attr(not(test), no_std)]
#![allow(clippy::upper_case_acronyms)]
#![allow(clippy::nonstandard_macro_braces)] // https://github.com/shepmaster/snafu/issues/296
#![warn(missing_docs)]

#[cfg(any(test, feature = "sim"))]
extern crate alloc;

pub mod boot;
pub mod image;
pub mod memory;
pub mod mm;
pub mod platform;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod xip;

pub use xip::{
    Error, GapRange, RegionConfigurator, SegmentDescriptor, SegmentKind, WriteProtection,
    XipConfig, XipSegments, XipState, NOT_FOUND,
};
