//! Translation-cache entry words.
//!
//! Each cache slot pairs a match word (`EntryHi`, holding the virtual page
//! number) with a data word (`EntryLo`, holding the physical frame number
//! and the valid/dirty bits).

use crate::mem::PAGE_SHIFT;
use arbitrary_int::u20;
use bitbybit::bitfield;

#[bitfield(u32, default = 0)]
pub struct EntryHi {
    #[bits(12..=31, rw)]
    vpn: u20,
}

#[bitfield(u32, default = 0)]
pub struct EntryLo {
    #[bit(0, rw)]
    valid: bool,
    #[bit(1, rw)]
    dirty: bool,
    #[bits(12..=31, rw)]
    pfn: u20,
}

impl EntryHi {
    /// Builds the match word for a page-aligned virtual address.
    pub fn for_page(page: usize) -> Self {
        Self::DEFAULT.with_vpn(u20::new((page >> PAGE_SHIFT) as u32))
    }

    pub fn page(self) -> usize {
        (self.vpn().value() as usize) << PAGE_SHIFT
    }
}

impl EntryLo {
    /// Builds the data word for a physical frame index.
    pub fn for_frame(frame: usize, dirty: bool) -> Self {
        Self::DEFAULT
            .with_pfn(u20::new(frame as u32))
            .with_dirty(dirty)
            .with_valid(true)
    }

    pub fn frame(self) -> usize {
        self.pfn().value() as usize
    }
}
