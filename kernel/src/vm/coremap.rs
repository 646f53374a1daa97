//! The coremap: one descriptor per physical frame, plus the scan and clock
//! logic that picks free runs and eviction victims. Everything here is pure
//! in-memory bookkeeping, called with the coremap spinlock held; the
//! surrounding I/O lives in [`super::VmSystem`].

use super::addrspace::PageTableEntry;
use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use arbitrary_int::u2;
use bitbybit::bitfield;
use marrowos_shared::mem::PAGE_FRAME_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Free,
    Kernel,
    User,
    /// Mid-eviction or mid-fault: neither evictable nor free.
    Transit,
}

impl FrameStatus {
    const fn from_bits(bits: u2) -> Self {
        match bits.value() {
            0b00 => FrameStatus::Free,
            0b01 => FrameStatus::Kernel,
            0b10 => FrameStatus::User,
            _ => FrameStatus::Transit,
        }
    }

    const fn bits(self) -> u2 {
        match self {
            FrameStatus::Free => u2::new(0b00),
            FrameStatus::Kernel => u2::new(0b01),
            FrameStatus::User => u2::new(0b10),
            FrameStatus::Transit => u2::new(0b11),
        }
    }
}

#[bitfield(u8, default = 0)]
pub struct FrameFlags {
    #[bits(0..=1, rw)]
    status_bits: u2,
    #[bit(2, rw)]
    recently_used: bool,
}

impl FrameFlags {
    fn status(self) -> FrameStatus {
        FrameStatus::from_bits(self.status_bits())
    }

    fn with_status(self, status: FrameStatus) -> Self {
        self.with_status_bits(status.bits())
    }
}

/// Descriptor for one physical frame.
///
/// `run_length` is meaningful only on the first frame of an allocation;
/// `owner` only for single-page `User`/`Transit` allocations (kernel runs
/// have no owner).
#[derive(Clone)]
pub struct FrameDescriptor {
    flags: FrameFlags,
    run_length: usize,
    owner: Option<Weak<PageTableEntry>>,
}

impl FrameDescriptor {
    fn new() -> Self {
        Self {
            flags: FrameFlags::DEFAULT,
            run_length: 0,
            owner: None,
        }
    }
}

pub struct CoreMap {
    frames: Box<[FrameDescriptor]>,
    clock_hand: usize,
    bytes_used: usize,
}

impl CoreMap {
    pub fn new(num_frames: usize) -> Self {
        assert!(num_frames > 0);
        Self {
            frames: vec![FrameDescriptor::new(); num_frames].into_boxed_slice(),
            clock_hand: 0,
            bytes_used: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn status(&self, frame: usize) -> FrameStatus {
        self.frames[frame].flags.status()
    }

    pub fn recently_used(&self, frame: usize) -> bool {
        self.frames[frame].flags.recently_used()
    }

    pub fn run_length(&self, frame: usize) -> usize {
        self.frames[frame].run_length
    }

    /// Does `frame`'s owner back-reference name `pte`?
    pub fn owner_is(&self, frame: usize, pte: &Arc<PageTableEntry>) -> bool {
        match &self.frames[frame].owner {
            Some(weak) => core::ptr::eq(weak.as_ptr(), Arc::as_ptr(pte)),
            None => false,
        }
    }

    /// First run of `n` consecutive free frames, scanning from frame 0.
    pub fn find_free_run(&self, n: usize) -> Option<usize> {
        let mut start = 0;
        while start + n <= self.frames.len() {
            let mut len = 0;
            while len < n && self.frames[start + len].flags.status() == FrameStatus::Free {
                len += 1;
            }
            if len == n {
                return Some(start);
            }
            // Too small; resume one past the frame that broke the run.
            start += len + 1;
        }
        None
    }

    pub fn mark_run(
        &mut self,
        start: usize,
        n: usize,
        status: FrameStatus,
        owner: Option<Weak<PageTableEntry>>,
    ) {
        assert!(status != FrameStatus::Free && n > 0);
        for frame in &mut self.frames[start..start + n] {
            assert!(frame.flags.status() == FrameStatus::Free);
            frame.flags = frame.flags.with_status(status);
            frame.run_length = 0;
            frame.owner = None;
        }
        self.frames[start].run_length = n;
        self.frames[start].owner = owner;
        self.bytes_used += n * PAGE_FRAME_SIZE;
    }

    /// Frees the run starting at `start`, returning its length. `start`
    /// must be the first frame of a run.
    pub fn release_run(&mut self, start: usize) -> usize {
        let n = self.frames[start].run_length;
        assert!(n > 0, "freeing an interior or unallocated frame");
        for frame in &mut self.frames[start..start + n] {
            debug_assert!(frame.flags.status() != FrameStatus::Free);
            frame.flags = FrameFlags::DEFAULT;
            frame.run_length = 0;
            frame.owner = None;
        }
        self.bytes_used -= n * PAGE_FRAME_SIZE;
        n
    }

    /// Clock scan for an eviction victim.
    ///
    /// Skips everything that is not a plain `User` frame; a set clock bit
    /// buys the frame one pass of immunity. The victim is re-marked
    /// `Transit` under `new_owner` before the lock is dropped, so no second
    /// evictor can pick it. Returns the victim index and its former owner.
    ///
    /// Two full sweeps clear every clock bit, so finding nothing by then
    /// means there is no evictable frame at all.
    pub fn claim_victim(
        &mut self,
        new_owner: Option<Weak<PageTableEntry>>,
    ) -> Option<(usize, Option<Weak<PageTableEntry>>)> {
        for _ in 0..2 * self.frames.len() {
            let idx = self.clock_hand;
            self.clock_hand = (self.clock_hand + 1) % self.frames.len();

            let frame = &mut self.frames[idx];
            if frame.flags.status() != FrameStatus::User {
                continue;
            }
            if frame.flags.recently_used() {
                frame.flags = frame.flags.with_recently_used(false);
                continue;
            }

            debug_assert_eq!(frame.run_length, 1);
            let old_owner = frame.owner.take();
            frame.owner = new_owner;
            frame.flags = frame
                .flags
                .with_status(FrameStatus::Transit)
                .with_recently_used(true);
            return Some((idx, old_owner));
        }
        None
    }

    /// Undoes [`Self::claim_victim`] when eviction cannot proceed.
    pub fn restore_victim(&mut self, frame: usize, old_owner: Option<Weak<PageTableEntry>>) {
        let desc = &mut self.frames[frame];
        debug_assert_eq!(desc.flags.status(), FrameStatus::Transit);
        desc.owner = old_owner;
        desc.flags = desc.flags.with_status(FrameStatus::User);
    }

    pub fn set_status(&mut self, frame: usize, status: FrameStatus) {
        let desc = &mut self.frames[frame];
        desc.flags = desc.flags.with_status(status);
    }

    pub fn set_recently_used(&mut self, frame: usize) {
        let desc = &mut self.frames[frame];
        desc.flags = desc.flags.with_recently_used(true);
    }
}
