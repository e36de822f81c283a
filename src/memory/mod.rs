/*
 * SPDX-License-Identifier: MIT OR BlueOak-1.0.0
 * Copyright (c) 2020-2022 Andre Richter <andre.o.richter@gmail.com>
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 * Original code distributed under MIT, additional changes are under BlueOak-1.0.0
 */

//! Memory address types shared by the relocation code.

pub mod mmu;

use {
    crate::mm,
    core::{
        fmt,
        marker::PhantomData,
        ops::{Add, Range, Sub},
    },
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Metadata trait for marking the type of an address.
pub trait AddressType: Copy + Clone + PartialOrd + PartialEq + Ord + Eq {}

/// Zero-sized type to mark a physical address.
#[derive(Copy, Clone, Debug, PartialOrd, PartialEq, Ord, Eq)]
pub enum Physical {}

/// Zero-sized type to mark a virtual address.
#[derive(Copy, Clone, Debug, PartialOrd, PartialEq, Ord, Eq)]
pub enum Virtual {}

/// Generic address type.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq)]
pub struct Address<ATYPE: AddressType> {
    value: usize,
    _address_type: PhantomData<fn() -> ATYPE>,
}

/// A contiguous byte range `[start, end_exclusive)` of one address kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryRegion<ATYPE: AddressType> {
    start: Address<ATYPE>,
    end_exclusive: Address<ATYPE>,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl AddressType for Physical {}
impl AddressType for Virtual {}

impl<ATYPE: AddressType> Address<ATYPE> {
    /// Create an instance.
    pub const fn new(value: usize) -> Self {
        Self {
            value,
            _address_type: PhantomData,
        }
    }

    /// Convert to usize.
    pub const fn as_usize(self) -> usize {
        self.value
    }

    /// Align down to the given power-of-two boundary.
    #[must_use]
    pub const fn align_down(self, alignment: usize) -> Self {
        Self::new(mm::align_down(self.value, alignment))
    }

    /// Align up to the given power-of-two boundary.
    #[must_use]
    pub const fn align_up(self, alignment: usize) -> Self {
        Self::new(mm::align_up(self.value, alignment))
    }

    /// Checks if the address is aligned to the given power-of-two boundary.
    pub const fn is_aligned(self, alignment: usize) -> bool {
        mm::is_aligned(self.value, alignment)
    }

    /// Offset of the address from the start of its page.
    pub const fn offset_into_page(self, page_size: usize) -> usize {
        self.value & (page_size - 1)
    }

    /// Add a signed displacement modulo the address width.
    #[must_use]
    pub const fn wrapping_add_signed(self, rhs: isize) -> Self {
        Self::new(self.value.wrapping_add_signed(rhs))
    }
}

impl<ATYPE: AddressType> Add<usize> for Address<ATYPE> {
    type Output = Self;

    #[inline(always)]
    fn add(self, rhs: usize) -> Self::Output {
        match self.value.checked_add(rhs) {
            None => panic!("Overflow on Address::add"),
            Some(x) => Self::new(x),
        }
    }
}

impl<ATYPE: AddressType> Sub<Address<ATYPE>> for Address<ATYPE> {
    type Output = usize;

    #[inline(always)]
    fn sub(self, rhs: Address<ATYPE>) -> Self::Output {
        match self.value.checked_sub(rhs.value) {
            None => panic!("Overflow on Address::sub"),
            Some(x) => x,
        }
    }
}

impl<ATYPE: AddressType> fmt::Debug for Address<ATYPE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#010x})", self.value)
    }
}

impl<ATYPE: AddressType> fmt::Display for Address<ATYPE> {
    // Don't expect to see physical addresses greater than 40 bit.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.value as u64;
        let q3: u8 = ((value >> 32) & 0xff) as u8;
        let q2: u16 = ((value >> 16) & 0xffff) as u16;
        let q1: u16 = (value & 0xffff) as u16;

        if q3 != 0 {
            write!(f, "0x{:02x}_", q3)?;
        } else {
            write!(f, "0x")?;
        }
        write!(f, "{:04x}_", q2)?;
        write!(f, "{:04x}", q1)
    }
}

impl<ATYPE: AddressType> MemoryRegion<ATYPE> {
    /// Create an instance.
    pub fn new(start: Address<ATYPE>, end_exclusive: Address<ATYPE>) -> Self {
        assert!(start <= end_exclusive);

        Self {
            start,
            end_exclusive,
        }
    }

    /// An empty region, contains nothing.
    pub const fn empty() -> Self {
        Self {
            start: Address::new(0),
            end_exclusive: Address::new(0),
        }
    }

    /// Checks if self contains an address.
    pub fn contains(&self, addr: Address<ATYPE>) -> bool {
        self.start <= addr && addr < self.end_exclusive
    }

    /// Checks if there is an overlap with another memory region.
    pub fn overlaps(&self, other: &Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.start < other.end_exclusive
            && other.start < self.end_exclusive
    }

    /// Returns the size in bytes of this region.
    pub fn size(&self) -> usize {
        // Invariant: start <= end_exclusive, so do unchecked arithmetic.
        self.end_exclusive.as_usize() - self.start.as_usize()
    }

    /// True if the region holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.start == self.end_exclusive
    }

    /// Returns the number of pages of `page_size` this region spans.
    pub fn num_pages(&self, page_size: usize) -> usize {
        mm::pages_for(self.size(), page_size)
    }
}

impl<ATYPE: AddressType> From<Range<usize>> for MemoryRegion<ATYPE> {
    fn from(range: Range<usize>) -> Self {
        Self::new(Address::new(range.start), Address::new(range.end))
    }
}

impl<ATYPE: AddressType> fmt::Display for MemoryRegion<ATYPE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (size, unit) = mm::size_human_readable_ceil(self.size());
        write!(
            f,
            "{}..{} | {: >3} {}",
            self.start, self.end_exclusive, size, unit
        )
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------
