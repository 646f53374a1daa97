//! The translation-cache synchronizer.
//!
//! Every probe/install/invalidate runs inside an interrupt-disabled window
//! ([`IrqLock`]); on a single core that is what makes the probe+write pair
//! atomic. Installs and flushes act on one CPU's cache. Eviction-driven
//! invalidation is broadcast to every CPU, so no core can keep translating
//! a virtual page whose frame has been handed to someone else.
//!
//! Replacement on a full cache is an arbitrary choice (xorshift), not LRU:
//! a full cache never blocks a fault, it just loses one translation.

use crate::sync::IrqLock;
use alloc::boxed::Box;
use marrowos_shared::tlb::{EntryHi, EntryLo};

pub const TLB_ENTRIES: usize = 64;

#[derive(Clone, Copy)]
struct TlbSlot {
    hi: EntryHi,
    lo: EntryLo,
}

impl TlbSlot {
    const INVALID: Self = Self {
        hi: EntryHi::DEFAULT,
        lo: EntryLo::DEFAULT,
    };
}

pub struct TranslationCache {
    slots: [TlbSlot; TLB_ENTRIES],
    rand_state: u32,
}

impl TranslationCache {
    fn new(seed: u32) -> Self {
        Self {
            slots: [TlbSlot::INVALID; TLB_ENTRIES],
            rand_state: seed | 1,
        }
    }

    fn probe(&self, page: usize) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.lo.valid() && s.hi.page() == page)
    }

    fn install(&mut self, page: usize, frame: usize) {
        let idx = match self.probe(page) {
            Some(idx) => idx,
            None => match self.slots.iter().position(|s| !s.lo.valid()) {
                Some(idx) => idx,
                None => self.next_random() % TLB_ENTRIES,
            },
        };
        self.slots[idx] = TlbSlot {
            hi: EntryHi::for_page(page),
            // Read-only enforcement is not implemented; every mapping is
            // installed writable.
            lo: EntryLo::for_frame(frame, true),
        };
    }

    fn invalidate(&mut self, page: usize) {
        if let Some(idx) = self.probe(page) {
            self.slots[idx] = TlbSlot::INVALID;
        }
    }

    fn flush(&mut self) {
        self.slots = [TlbSlot::INVALID; TLB_ENTRIES];
    }

    fn lookup(&self, page: usize) -> Option<usize> {
        self.probe(page).map(|idx| self.slots[idx].lo.frame())
    }

    fn next_random(&mut self) -> usize {
        // xorshift32
        let mut x = self.rand_state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.rand_state = x;
        x as usize
    }
}

/// One translation cache per CPU.
pub struct TlbState {
    cpus: Box<[IrqLock<TranslationCache>]>,
}

impl TlbState {
    pub fn new(num_cpus: usize) -> Self {
        assert!(num_cpus > 0);
        let cpus = (0..num_cpus)
            .map(|cpu| IrqLock::new(TranslationCache::new(0x9E37_79B9 ^ cpu as u32)))
            .collect();
        Self { cpus }
    }

    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// Install-or-overwrite the mapping for `page` on `cpu`.
    pub fn install(&self, cpu: usize, page: usize, frame: usize) {
        self.cpus[cpu].lock().install(page, frame);
    }

    /// Drops any translation for `page` on every CPU.
    pub fn invalidate(&self, page: usize) {
        for cache in &*self.cpus {
            cache.lock().invalidate(page);
        }
    }

    /// Drops every translation on `cpu`; run on context switch.
    pub fn flush(&self, cpu: usize) {
        self.cpus[cpu].lock().flush();
    }

    pub fn lookup(&self, cpu: usize, page: usize) -> Option<usize> {
        self.cpus[cpu].lock().lookup(page)
    }
}
