/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! In-memory SoC model: flash, PSRAM, MMU tables and a write-back data cache.
//!
//! The cache is page granular and virtually tagged. A line is filled on first access through the
//! mapping current at that moment and keeps its contents when the mapping changes, until it is
//! invalidated. Writes stay in the line until written back. This is enough to catch a missing
//! invalidation or writeback in the relocation sequence.

use {
    crate::{
        memory::{
            mmu::{
                interface::{AddressTranslator, CacheController, PageCopier},
                MmuId, MmuTarget,
            },
            Address, MemoryRegion, Physical, Virtual,
        },
        platform::PlatformLayout,
    },
    alloc::{collections::BTreeMap, vec, vec::Vec},
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Small layout with 4 KiB pages and separate 4 MiB windows.
pub const TEST_LAYOUT: PlatformLayout = PlatformLayout {
    name: "sim",
    page_size: 0x1000,
    flash_vaddr_low: 0x4000_0000,
    flash_vaddr_high: 0x4040_0000,
    psram_vaddr_low: 0x4800_0000,
    psram_vaddr_high: 0x4840_0000,
};

/// One call into the HAL, as recorded by [`SimSoc`].
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HalOp {
    Map {
        mmu: MmuId,
        target: MmuTarget,
        vaddr: Address<Virtual>,
        paddr: Address<Physical>,
    },
    Invalidate {
        vaddr: Address<Virtual>,
        len: usize,
    },
    Writeback {
        vaddr: Address<Virtual>,
        len: usize,
    },
    Copy {
        dst: Address<Virtual>,
        src: Address<Virtual>,
        len: usize,
    },
}

#[derive(Copy, Clone, Debug)]
struct PageEntry {
    target: MmuTarget,
    paddr: usize,
}

#[derive(Clone, Debug)]
struct CacheLine {
    data: Vec<u8>,
    dirty: bool,
}

/// Simulated chip.
pub struct SimSoc {
    layout: PlatformLayout,
    flash: Vec<u8>,
    psram: Vec<u8>,
    /// Page entries keyed by virtual page address, one table per MMU.
    tables: [BTreeMap<usize, PageEntry>; 2],
    cache: BTreeMap<usize, CacheLine>,
    ops: Vec<HalOp>,
    maps_left: Option<usize>,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

/// Deterministic filler, different for every page of a realistic image.
pub fn pattern_byte(offset: usize) -> u8 {
    (offset as u8) ^ ((offset >> 8) as u8).rotate_left(3) ^ ((offset >> 16) as u8).wrapping_mul(7)
}

impl SimSoc {
    /// Create a chip with zeroed memories and empty MMU tables.
    pub fn new(layout: PlatformLayout, flash_size: usize, psram_size: usize) -> Self {
        Self {
            layout,
            flash: vec![0; flash_size],
            psram: vec![0; psram_size],
            tables: [BTreeMap::new(), BTreeMap::new()],
            cache: BTreeMap::new(),
            ops: Vec::new(),
            maps_left: None,
        }
    }

    /// Fill the flash with [`pattern_byte`] of each offset.
    pub fn fill_flash_with_pattern(&mut self) {
        for (offset, byte) in self.flash.iter_mut().enumerate() {
            *byte = pattern_byte(offset);
        }
    }

    /// The layout the chip was created with.
    pub fn layout(&self) -> &PlatformLayout {
        &self.layout
    }

    /// Raw flash contents.
    pub fn flash(&self) -> &[u8] {
        &self.flash
    }

    /// Raw flash contents, for loading an image.
    pub fn flash_mut(&mut self) -> &mut [u8] {
        &mut self.flash
    }

    /// Raw PSRAM contents. Dirty cache lines are not visible here.
    pub fn psram(&self) -> &[u8] {
        &self.psram
    }

    /// Every HAL call so far, in order.
    pub fn ops(&self) -> &[HalOp] {
        &self.ops
    }

    /// Forget the recorded HAL calls.
    pub fn clear_ops(&mut self) {
        self.ops.clear();
    }

    /// Make every `map_region` call after the next `count` ones map nothing.
    pub fn fail_mappings_after(&mut self, count: usize) {
        self.maps_left = Some(count);
    }

    /// Read `len` bytes at `vaddr` the way the CPU would see them, without allocating lines.
    ///
    /// # Panics
    ///
    /// - If a page in the range is not mapped.
    pub fn read_virt(&self, vaddr: Address<Virtual>, len: usize) -> Vec<u8> {
        (vaddr.as_usize()..vaddr.as_usize() + len)
            .map(|addr| {
                let page = self.page_of(addr);
                let offset = addr - page;
                match self.cache.get(&page) {
                    Some(line) => line.data[offset],
                    None => {
                        let (target, paddr) = self.resolve(page);
                        self.memory(target)[paddr + offset]
                    }
                }
            })
            .collect()
    }

    fn page_of(&self, addr: usize) -> usize {
        addr & !(self.layout.page_size - 1)
    }

    fn table_index(&self, mmu: MmuId) -> usize {
        if self.layout.shares_vaddr_space() {
            return 0;
        }
        match mmu {
            MmuId::Flash => 0,
            MmuId::Psram => 1,
        }
    }

    fn window(&self, mmu: MmuId) -> MemoryRegion<Virtual> {
        match mmu {
            MmuId::Flash => self.layout.flash_window(),
            MmuId::Psram => self.layout.psram_window(),
        }
    }

    /// Which MMU a CPU access to `vaddr` goes through.
    fn mmu_for_access(&self, vaddr: usize) -> MmuId {
        if self.layout.psram_window().contains(Address::new(vaddr)) {
            MmuId::Psram
        } else if self.layout.flash_window().contains(Address::new(vaddr)) {
            MmuId::Flash
        } else {
            panic!("Access outside of both virtual windows at {:#x}", vaddr);
        }
    }

    fn resolve(&self, page: usize) -> (MmuTarget, usize) {
        let mmu = self.mmu_for_access(page);
        match self.tables[self.table_index(mmu)].get(&page) {
            Some(entry) => (entry.target, entry.paddr),
            None => panic!("Access to unmapped page {:#x}", page),
        }
    }

    fn memory(&self, target: MmuTarget) -> &[u8] {
        match target {
            MmuTarget::Flash0 => &self.flash,
            MmuTarget::Psram0 => &self.psram,
        }
    }

    fn line(&mut self, page: usize) -> &mut CacheLine {
        let fill = (!self.cache.contains_key(&page)).then(|| {
            let (target, paddr) = self.resolve(page);
            self.memory(target)[paddr..paddr + self.layout.page_size].to_vec()
        });
        self.cache.entry(page).or_insert_with(|| CacheLine {
            data: fill.unwrap_or_default(),
            dirty: false,
        })
    }

    fn read_byte(&mut self, addr: usize) -> u8 {
        let page = self.page_of(addr);
        self.line(page).data[addr - page]
    }

    fn write_byte(&mut self, addr: usize, value: u8) {
        let page = self.page_of(addr);
        let (target, _) = self.resolve(page);
        assert_eq!(target, MmuTarget::Psram0, "Store to flash at {:#x}", addr);
        let line = self.line(page);
        line.data[addr - page] = value;
        line.dirty = true;
    }

    fn pages_in(&self, vaddr: Address<Virtual>, len: usize) -> Vec<usize> {
        if len == 0 {
            return Vec::new();
        }
        let first = self.page_of(vaddr.as_usize());
        let last = self.page_of(vaddr.as_usize() + len - 1);
        (first..=last).step_by(self.layout.page_size).collect()
    }
}

impl AddressTranslator for SimSoc {
    unsafe fn map_region(
        &mut self,
        mmu: MmuId,
        target: MmuTarget,
        vaddr: Address<Virtual>,
        paddr: Address<Physical>,
        len: usize,
    ) -> usize {
        let page_size = self.layout.page_size;
        assert!(
            vaddr.is_aligned(page_size) && paddr.is_aligned(page_size),
            "Unaligned mapping request"
        );
        self.ops.push(HalOp::Map {
            mmu,
            target,
            vaddr,
            paddr,
        });

        if let Some(left) = self.maps_left.as_mut() {
            if *left == 0 {
                return 0;
            }
            *left -= 1;
        }

        let window = self.window(mmu);
        let device_size = self.memory(target).len();
        let table = self.table_index(mmu);
        let mut mapped = 0;
        while mapped < len {
            let v = vaddr.as_usize() + mapped;
            let p = paddr.as_usize() + mapped;
            if !window.contains(Address::new(v)) || p + page_size > device_size {
                break;
            }
            self.tables[table].insert(v, PageEntry { target, paddr: p });
            mapped += page_size;
        }
        mapped
    }

    fn vaddr_to_paddr(
        &self,
        mmu: MmuId,
        vaddr: Address<Virtual>,
    ) -> Option<(Address<Physical>, MmuTarget)> {
        let page = self.page_of(vaddr.as_usize());
        self.tables[self.table_index(mmu)]
            .get(&page)
            .map(|entry| {
                (
                    Address::new(entry.paddr + (vaddr.as_usize() - page)),
                    entry.target,
                )
            })
    }
}

impl CacheController for SimSoc {
    unsafe fn invalidate_addr(&mut self, vaddr: Address<Virtual>, len: usize) {
        self.ops.push(HalOp::Invalidate { vaddr, len });
        for page in self.pages_in(vaddr, len) {
            self.cache.remove(&page);
        }
    }

    fn writeback_addr(&mut self, vaddr: Address<Virtual>, len: usize) {
        self.ops.push(HalOp::Writeback { vaddr, len });
        for page in self.pages_in(vaddr, len) {
            let dirty = matches!(self.cache.get(&page), Some(line) if line.dirty);
            if !dirty {
                continue;
            }
            let (target, paddr) = self.resolve(page);
            assert_eq!(target, MmuTarget::Psram0, "Writeback into flash at {:#x}", page);
            if let Some(line) = self.cache.get_mut(&page) {
                self.psram[paddr..paddr + line.data.len()].copy_from_slice(&line.data);
                line.dirty = false;
            }
        }
    }
}

impl PageCopier for SimSoc {
    unsafe fn copy_page(&mut self, dst: Address<Virtual>, src: Address<Virtual>, len: usize) {
        self.ops.push(HalOp::Copy { dst, src, len });
        let bytes: Vec<u8> = (0..len)
            .map(|i| self.read_byte(src.as_usize() + i))
            .collect();
        for (i, byte) in bytes.into_iter().enumerate() {
            self.write_byte(dst.as_usize() + i, byte);
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 0x1000;

    #[test]
    fn mapping_outside_the_window_maps_nothing() {
        let mut soc = SimSoc::new(TEST_LAYOUT, 0x1_0000, 0x1_0000);
        let mapped = unsafe {
            soc.map_region(
                MmuId::Psram,
                MmuTarget::Psram0,
                Address::new(0x4840_0000),
                Address::new(0),
                PAGE,
            )
        };
        assert_eq!(mapped, 0);
        assert_eq!(soc.vaddr_to_paddr(MmuId::Psram, Address::new(0x4840_0000)), None);
    }

    #[test]
    fn mapping_stops_at_device_end() {
        let mut soc = SimSoc::new(TEST_LAYOUT, 0x1_0000, 0x2000);
        let mapped = unsafe {
            soc.map_region(
                MmuId::Psram,
                MmuTarget::Psram0,
                Address::new(0x4800_0000),
                Address::new(0x1000),
                3 * PAGE,
            )
        };
        assert_eq!(mapped, PAGE);
    }

    #[test]
    fn stores_stay_in_cache_until_writeback() {
        let mut soc = SimSoc::new(TEST_LAYOUT, 0x1_0000, 0x1_0000);
        soc.fill_flash_with_pattern();
        let dst = Address::new(0x4800_0000);
        let src = Address::new(0x4000_0000);
        unsafe {
            soc.map_region(MmuId::Psram, MmuTarget::Psram0, dst, Address::new(0), PAGE);
            soc.map_region(MmuId::Flash, MmuTarget::Flash0, src, Address::new(0x2000), PAGE);
            soc.copy_page(dst, src, PAGE);
        }
        assert!(soc.psram()[..PAGE].iter().all(|b| *b == 0));
        assert_eq!(&soc.read_virt(dst, PAGE)[..], &soc.flash()[0x2000..0x3000]);

        soc.writeback_addr(dst, PAGE);
        assert_eq!(&soc.psram()[..PAGE], &soc.flash()[0x2000..0x3000]);
    }

    #[test]
    fn invalidate_discards_dirty_lines() {
        let mut soc = SimSoc::new(TEST_LAYOUT, 0x1_0000, 0x1_0000);
        soc.fill_flash_with_pattern();
        let dst = Address::new(0x4800_0000);
        let src = Address::new(0x4000_0000);
        unsafe {
            soc.map_region(MmuId::Psram, MmuTarget::Psram0, dst, Address::new(0), PAGE);
            soc.map_region(MmuId::Flash, MmuTarget::Flash0, src, Address::new(0), PAGE);
            soc.copy_page(dst, src, PAGE);
            soc.invalidate_addr(dst, PAGE);
        }
        soc.writeback_addr(dst, PAGE);
        assert!(soc.read_virt(dst, PAGE).iter().all(|b| *b == 0));
    }

    #[test]
    fn shared_space_uses_one_table() {
        let layout = crate::platform::esp32c5::LAYOUT;
        let mut soc = SimSoc::new(layout, 0x4_0000, 0x4_0000);
        let vaddr = Address::new(layout.psram_vaddr_low);
        unsafe {
            soc.map_region(MmuId::Psram, MmuTarget::Psram0, vaddr, Address::new(0), layout.page_size);
        }
        assert_eq!(
            soc.vaddr_to_paddr(MmuId::Flash, vaddr),
            Some((Address::new(0), MmuTarget::Psram0))
        );
    }

    #[test]
    fn pattern_differs_between_pages() {
        assert_ne!(pattern_byte(0x1_0000), pattern_byte(0x1_1000));
        assert_ne!(pattern_byte(0x1_0000), pattern_byte(0x2_0000));
    }
}
