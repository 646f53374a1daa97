//! The virtual-memory subsystem.
//!
//! [`VmSystem`] owns the coremap, the swap store, and the per-CPU
//! translation caches. It is constructed once at bootstrap and handed to
//! all callers by shared reference.
//!
//! Lock order: the coremap spinlock is always acquired and released before
//! any page-table-entry or bitmap lock in the same call chain. Eviction
//! claims its victim under the spinlock, then drops it before touching the
//! victim's entry lock or the disk.

pub mod addrspace;
pub mod coremap;
pub mod error;
pub mod fault;
pub mod swap;
pub mod tlb;

pub use addrspace::{AddressSpace, PageTableEntry, Region, RegionPerms, Residency};
pub use coremap::FrameStatus;
pub use error::VmError;
pub use fault::FaultKind;

use crate::block::BlockDevice;
use crate::sync::SpinLock;
use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use coremap::CoreMap;
use core::ptr::NonNull;
use marrowos_shared::mem::PAGE_FRAME_SIZE;
use marrowos_shared::{eprintln, println};
use swap::SwapStore;
use tlb::TlbState;

/// Placeholder frame index for an entry whose first frame has not been
/// installed yet, and dead marker for an entry torn down while an evictor
/// held a claim on its frame. Never observable as a real mapping: the
/// entry lock is held whenever an entry carries it.
pub(crate) const FRAME_PENDING: usize = usize::MAX;

pub struct VmSystem {
    /// Kernel-virtual base of the managed physical region.
    base: NonNull<u8>,
    num_frames: usize,
    coremap: SpinLock<CoreMap>,
    swap: Option<SwapStore>,
    tlb: TlbState,
}

// SAFETY: `base` is an exclusively owned region whose frames are handed
// out under coremap discipline; all interior state is lock-protected.
unsafe impl Send for VmSystem {}
unsafe impl Sync for VmSystem {}

impl VmSystem {
    /// Builds the subsystem over the physical region at `base`.
    ///
    /// A missing swap device permanently disables swapping: out-of-frames
    /// then becomes a hard allocation failure instead of an eviction.
    ///
    /// # Safety
    ///
    /// `base` must point at `num_frames` whole, page-aligned frames owned
    /// exclusively by the returned system.
    pub unsafe fn bootstrap(
        base: NonNull<u8>,
        num_frames: usize,
        num_cpus: usize,
        swap_device: Option<Box<dyn BlockDevice>>,
    ) -> Self {
        let swap = match swap_device {
            Some(device) => {
                let store = SwapStore::bootstrap(device);
                println!("vm: swap store with {} slots", store.capacity());
                Some(store)
            }
            None => {
                eprintln!("vm: no swap device, swapping disabled");
                None
            }
        };
        println!("vm: managing {num_frames} frames on {num_cpus} CPU(s)");
        Self {
            base,
            num_frames,
            coremap: SpinLock::new(CoreMap::new(num_frames)),
            swap,
            tlb: TlbState::new(num_cpus),
        }
    }

    pub fn swapping_enabled(&self) -> bool {
        self.swap.is_some()
    }

    pub fn frame_count(&self) -> usize {
        self.num_frames
    }

    /// Running total of currently allocated bytes.
    pub fn used_bytes(&self) -> usize {
        self.coremap.lock().bytes_used()
    }

    pub fn swap_slots_in_use(&self) -> usize {
        self.swap.as_ref().map_or(0, SwapStore::slots_in_use)
    }

    pub fn tlb(&self) -> &TlbState {
        &self.tlb
    }

    /// Flushes `cpu`'s translation cache; run when switching address
    /// spaces.
    pub fn activate(&self, cpu: usize) {
        self.tlb.flush(cpu);
    }

    /// Allocates `n` contiguous zeroed pages for the kernel.
    pub fn allocate_kernel_pages(&self, n: usize) -> Result<NonNull<u8>, VmError> {
        let frame = self.allocate_frames(n, FrameStatus::Kernel, None)?;
        NonNull::new(self.frame_ptr(frame)).ok_or(VmError::OutOfMemory)
    }

    /// Frees a run previously returned by [`Self::allocate_kernel_pages`].
    /// `ptr` must be the exact base address of that run.
    pub fn free_kernel_pages(&self, ptr: NonNull<u8>) {
        let offset = ptr.as_ptr() as usize - self.base.as_ptr() as usize;
        debug_assert_eq!(offset % PAGE_FRAME_SIZE, 0);
        self.free_run(offset / PAGE_FRAME_SIZE);
    }

    pub(crate) fn swap_store(&self) -> Option<&SwapStore> {
        self.swap.as_ref()
    }

    pub(crate) fn frame_ptr(&self, frame: usize) -> *mut u8 {
        debug_assert!(frame < self.frame_count());
        // SAFETY: in bounds of the bootstrap region per the debug assert.
        unsafe { self.base.as_ptr().add(frame * PAGE_FRAME_SIZE) }
    }

    /// Allocates `n` contiguous frames, returning the first frame index.
    ///
    /// The fast path hands out a free run and never blocks. Under pressure
    /// (single frames only) a clock pass picks a `User` victim, whose page
    /// is written out to a fresh swap slot under its entry lock; the
    /// victim's translation is invalidated on every CPU before the frame
    /// is recycled.
    ///
    /// Frames obtained with `status == Transit` stay `Transit` until the
    /// caller finishes the mapping; any other status is applied before
    /// returning.
    pub(crate) fn allocate_frames(
        &self,
        n: usize,
        status: FrameStatus,
        owner: Option<Weak<PageTableEntry>>,
    ) -> Result<usize, VmError> {
        assert!(n > 0);
        debug_assert!(status != FrameStatus::Free);

        {
            let mut cm = self.coremap.lock();
            if let Some(start) = cm.find_free_run(n) {
                cm.mark_run(start, n, status, owner);
                // Zeroing is a pure memory write, fine under the spinlock.
                // SAFETY: the run was just marked ours.
                unsafe { core::ptr::write_bytes(self.frame_ptr(start), 0, n * PAGE_FRAME_SIZE) };
                return Ok(start);
            }
        }

        let Some(swap) = self.swap.as_ref() else {
            return Err(VmError::OutOfMemory);
        };
        // Multi-page allocation under memory pressure is not supported:
        // eviction frees one frame at a time.
        if n != 1 {
            return Err(VmError::OutOfMemory);
        }

        let (victim, old_owner) = self
            .coremap
            .lock()
            .claim_victim(owner)
            .ok_or(VmError::OutOfMemory)?;

        let slot = match swap.allocate_slot() {
            Ok(slot) => slot,
            Err(e) => {
                self.coremap.lock().restore_victim(victim, old_owner);
                return Err(e);
            }
        };

        let upgraded = old_owner.as_ref().and_then(Weak::upgrade);
        match upgraded {
            Some(old_pte) => {
                let mut state = old_pte.state().lock();
                if matches!(*state, Residency::Resident(f) if f == victim) {
                    // SAFETY: the entry lock keeps the victim's content
                    // stable for the write-out.
                    if let Err(e) = unsafe { swap.write_page(self.frame_ptr(victim), slot) } {
                        swap.free_slot(slot);
                        drop(state);
                        self.coremap.lock().restore_victim(victim, old_owner);
                        return Err(e);
                    }
                    *state = Residency::Swapped(slot);
                    self.tlb.invalidate(old_pte.virtual_page());
                } else {
                    // The owning address space was torn down between the
                    // claim and here; its content is unreferenced.
                    drop(state);
                    swap.free_slot(slot);
                }
            }
            None => swap.free_slot(slot),
        }

        // SAFETY: the victim is ours (Transit) from here on.
        unsafe { core::ptr::write_bytes(self.frame_ptr(victim), 0, PAGE_FRAME_SIZE) };
        if status != FrameStatus::Transit {
            self.coremap.lock().set_status(victim, status);
        }
        Ok(victim)
    }

    /// Frees the run starting at `frame`, whatever its status.
    pub(crate) fn free_run(&self, frame: usize) {
        self.coremap.lock().release_run(frame);
    }

    /// Completes a user mapping: flips a `Transit` frame to `User` and
    /// gives it its clock bit.
    pub(crate) fn finish_user_frame(&self, frame: usize) {
        let mut cm = self.coremap.lock();
        debug_assert_eq!(cm.status(frame), FrameStatus::Transit);
        cm.set_status(frame, FrameStatus::User);
        cm.set_recently_used(frame);
    }

    /// Marks `frame` recently used for the clock scan.
    pub(crate) fn touch_frame(&self, frame: usize) {
        self.coremap.lock().set_recently_used(frame);
    }

    /// Pins a resident frame (`User` -> `Transit`) so eviction cannot take
    /// it mid-copy. Returns `false` if an evictor claimed it first; the
    /// claim then stands and must not be undone.
    pub(crate) fn pin_for_copy(&self, frame: usize, pte: &Arc<PageTableEntry>) -> bool {
        let mut cm = self.coremap.lock();
        if cm.status(frame) == FrameStatus::User && cm.owner_is(frame, pte) {
            cm.set_status(frame, FrameStatus::Transit);
            true
        } else {
            false
        }
    }

    pub(crate) fn unpin_after_copy(&self, frame: usize, pinned: bool) {
        if pinned {
            let mut cm = self.coremap.lock();
            debug_assert_eq!(cm.status(frame), FrameStatus::Transit);
            cm.set_status(frame, FrameStatus::User);
        }
    }

    /// Frees a user frame during address-space teardown. Returns `false`
    /// if an evictor holds a claim on the frame, in which case the frame
    /// now belongs to the evictor's caller.
    pub(crate) fn release_user_frame(&self, frame: usize, pte: &Arc<PageTableEntry>) -> bool {
        let mut cm = self.coremap.lock();
        if cm.status(frame) == FrameStatus::User && cm.owner_is(frame, pte) {
            cm.release_run(frame);
            true
        } else {
            debug_assert_eq!(cm.status(frame), FrameStatus::Transit);
            false
        }
    }
}
