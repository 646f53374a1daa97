//! Per-process address spaces: the region list describing what is mapped,
//! and the page table recording where each touched page currently lives
//! (a physical frame or a swap slot).

use super::coremap::FrameStatus;
use super::error::VmError;
use super::{VmSystem, FRAME_PENDING};
use crate::sync::SleepLock;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitbybit::bitfield;
use marrowos_shared::mem::{
    page_align_down, page_align_up, page_offset, PAGE_FRAME_SIZE, USER_STACK_PAGES, USER_TOP,
};

#[bitfield(u8, default = 0)]
pub struct RegionPerms {
    #[bit(0, rw)]
    readable: bool,
    #[bit(1, rw)]
    writeable: bool,
    #[bit(2, rw)]
    executable: bool,
}

impl RegionPerms {
    pub fn from_flags(readable: bool, writeable: bool, executable: bool) -> Self {
        Self::DEFAULT
            .with_readable(readable)
            .with_writeable(writeable)
            .with_executable(executable)
    }
}

/// A page-aligned range of mapped user virtual addresses. Metadata only;
/// regions hold no frames themselves.
#[derive(Clone)]
pub struct Region {
    start: usize,
    len: usize,
    perms: RegionPerms,
}

impl Region {
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn perms(&self) -> RegionPerms {
        self.perms
    }

    fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.start + self.len
    }

    fn overlaps(&self, start: usize, len: usize) -> bool {
        start < self.start + self.len && self.start < start + len
    }
}

/// Where a touched page currently lives. Exactly one of the two holds at
/// any time; transitions happen under the entry lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Residency {
    Resident(usize),
    Swapped(usize),
}

/// One mapped virtual page. The lock guards the residency transition and
/// its side effects (frame content, translation-cache entry) and is held
/// across the disk I/O backing the transition.
pub struct PageTableEntry {
    vpn: usize,
    state: SleepLock<Residency>,
}

impl PageTableEntry {
    pub(crate) fn new(vpn: usize, residency: Residency) -> Self {
        debug_assert_eq!(page_offset(vpn), 0);
        Self {
            vpn,
            state: SleepLock::new(residency),
        }
    }

    pub fn virtual_page(&self) -> usize {
        self.vpn
    }

    pub(crate) fn state(&self) -> &SleepLock<Residency> {
        &self.state
    }
}

pub struct AddressSpace {
    regions: Vec<Region>,
    pub(crate) entries: SleepLock<BTreeMap<usize, Arc<PageTableEntry>>>,
    heap_start: usize,
    heap_end: usize,
    /// Index of the heap region in `regions`, once the load completes.
    heap_region: Option<usize>,
    stack_defined: bool,
    loaded: bool,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace {
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
            entries: SleepLock::new(BTreeMap::new()),
            heap_start: 0,
            heap_end: 0,
            heap_region: None,
            stack_defined: false,
            loaded: false,
        }
    }

    /// Defines a segment at `vaddr` of `size` bytes, page-aligning both.
    /// The heap floats to just past the most recently defined segment.
    pub fn define_region(
        &mut self,
        vaddr: usize,
        size: usize,
        readable: bool,
        writeable: bool,
        executable: bool,
    ) {
        assert!(!self.loaded, "region defined after load completion");

        let size = page_align_up(size + page_offset(vaddr));
        let vaddr = page_align_down(vaddr);
        debug_assert!(
            !self.regions.iter().any(|r| r.overlaps(vaddr, size)),
            "overlapping region at {vaddr:#x}"
        );

        self.regions.push(Region {
            start: vaddr,
            len: size,
            perms: RegionPerms::from_flags(readable, writeable, executable),
        });
        self.heap_start = vaddr + size;
        self.heap_end = self.heap_start;
    }

    /// Ends the load phase: creates the (initially empty) heap region just
    /// past the last defined segment. Runs exactly once.
    pub fn complete_load(&mut self) {
        assert!(!self.loaded, "load completed twice");
        self.regions.push(Region {
            start: self.heap_start,
            len: 0,
            perms: RegionPerms::from_flags(true, true, false),
        });
        self.heap_region = Some(self.regions.len() - 1);
        self.loaded = true;
    }

    /// Appends the fixed-size stack region ending at the top of user
    /// address space. Returns the initial stack pointer. Runs exactly once.
    pub fn define_stack(&mut self) -> usize {
        assert!(!self.stack_defined, "stack defined twice");
        let len = USER_STACK_PAGES * PAGE_FRAME_SIZE;
        debug_assert!(!self.regions.iter().any(|r| r.overlaps(USER_TOP - len, len)));
        self.regions.push(Region {
            start: USER_TOP - len,
            len,
            perms: RegionPerms::from_flags(true, true, false),
        });
        self.stack_defined = true;
        USER_TOP
    }

    /// Moves the heap break by `amount` bytes, returning the old break.
    /// Pages above a lowered break stay mapped until the address space is
    /// destroyed.
    pub fn extend_heap(&mut self, amount: isize) -> Result<usize, VmError> {
        let heap_region = self
            .heap_region
            .expect("heap does not exist before load completion");

        let old_break = self.heap_end;
        let new_break = if amount >= 0 {
            old_break.checked_add(amount as usize)
        } else {
            old_break.checked_sub(amount.unsigned_abs())
        }
        .ok_or(VmError::SegmentationFault)?;
        if new_break < self.heap_start {
            return Err(VmError::SegmentationFault);
        }

        let new_len = page_align_up(new_break - self.heap_start);
        let collides = self
            .regions
            .iter()
            .enumerate()
            .any(|(i, r)| i != heap_region && r.overlaps(self.heap_start, new_len));
        if collides {
            return Err(VmError::OutOfMemory);
        }

        self.regions[heap_region].len = new_len;
        self.heap_end = new_break;
        Ok(old_break)
    }

    pub fn heap_bounds(&self) -> (usize, usize) {
        (self.heap_start, self.heap_end)
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub(crate) fn region_for(&self, addr: usize) -> Option<&Region> {
        self.regions.iter().find(|r| r.contains(addr))
    }

    /// Current residency of the page at `vaddr`, if it has ever been
    /// touched.
    pub fn residency_of(&self, vaddr: usize) -> Option<Residency> {
        let pte = self.entries.lock().get(&page_align_down(vaddr)).cloned()?;
        let state = pte.state.lock();
        Some(*state)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Deep-duplicates this address space: regions verbatim, every touched
    /// page eagerly copied (no copy-on-write). With swapping enabled the
    /// copy round-trips through freshly allocated swap slots; without it,
    /// each page is byte-copied into a fresh frame. Any allocation failure
    /// tears down the partial copy and propagates.
    pub fn copy(&self, vm: &VmSystem) -> Result<AddressSpace, VmError> {
        let mut new_as = AddressSpace {
            regions: self.regions.clone(),
            entries: SleepLock::new(BTreeMap::new()),
            heap_start: self.heap_start,
            heap_end: self.heap_end,
            heap_region: self.heap_region,
            stack_defined: self.stack_defined,
            loaded: self.loaded,
        };

        let snapshot: Vec<Arc<PageTableEntry>> = self.entries.lock().values().cloned().collect();

        for src in &snapshot {
            match Self::copy_entry(src, vm) {
                Ok(new_pte) => {
                    new_as.entries.get_mut().insert(new_pte.vpn, new_pte);
                }
                Err(e) => {
                    new_as.destroy(vm);
                    return Err(e);
                }
            }
        }
        Ok(new_as)
    }

    fn copy_entry(src: &Arc<PageTableEntry>, vm: &VmSystem) -> Result<Arc<PageTableEntry>, VmError> {
        // Serializes against eviction of, and faults on, the source page.
        let state = src.state.lock();
        match (*state, vm.swap_store()) {
            (Residency::Swapped(src_slot), Some(swap)) => {
                // Stage the page through a temporary frame, then push it
                // back out to a slot of its own.
                let new_pte = Arc::new(PageTableEntry::new(src.vpn, Residency::Swapped(0)));
                let temp =
                    vm.allocate_frames(1, FrameStatus::Transit, Some(Arc::downgrade(&new_pte)))?;
                let result = (|| {
                    // SAFETY: `temp` is a whole frame owned by this copy.
                    unsafe { swap.read_page(src_slot, vm.frame_ptr(temp))? };
                    let slot = swap.allocate_slot()?;
                    if let Err(e) = unsafe { swap.write_page(vm.frame_ptr(temp), slot) } {
                        swap.free_slot(slot);
                        return Err(e);
                    }
                    Ok(slot)
                })();
                vm.free_run(temp);
                let slot = result?;
                *new_pte.state.lock() = Residency::Swapped(slot);
                Ok(new_pte)
            }
            (Residency::Resident(frame), Some(swap)) => {
                // Pin the source frame so it cannot be evicted mid-copy. If
                // an evictor claimed it first it is now blocked on the entry
                // lock we hold, so the content stays stable either way.
                let pinned = vm.pin_for_copy(frame, src);
                let result = (|| {
                    let slot = swap.allocate_slot()?;
                    // SAFETY: the entry lock keeps `frame` stable.
                    if let Err(e) = unsafe { swap.write_page(vm.frame_ptr(frame), slot) } {
                        swap.free_slot(slot);
                        return Err(e);
                    }
                    Ok(slot)
                })();
                vm.unpin_after_copy(frame, pinned);
                let slot = result?;
                Ok(Arc::new(PageTableEntry::new(
                    src.vpn,
                    Residency::Swapped(slot),
                )))
            }
            (Residency::Resident(frame), None) => {
                let new_pte =
                    Arc::new(PageTableEntry::new(src.vpn, Residency::Resident(FRAME_PENDING)));
                let new_frame =
                    vm.allocate_frames(1, FrameStatus::Transit, Some(Arc::downgrade(&new_pte)))?;
                // SAFETY: distinct frames; source is stable under the entry
                // lock, destination is ours.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        vm.frame_ptr(frame).cast_const(),
                        vm.frame_ptr(new_frame),
                        PAGE_FRAME_SIZE,
                    );
                }
                vm.finish_user_frame(new_frame);
                *new_pte.state.lock() = Residency::Resident(new_frame);
                Ok(new_pte)
            }
            (Residency::Swapped(_), None) => {
                unreachable!("swapped entry while swapping is disabled")
            }
        }
    }

    /// Releases every frame and slot this address space owns, then the
    /// bookkeeping itself. Single owning thread at process exit; eviction
    /// of our frames by other processes is serialized per entry.
    pub fn destroy(mut self, vm: &VmSystem) {
        let entries = core::mem::take(self.entries.get_mut());
        for (_vpn, pte) in entries {
            let mut state = pte.state.lock();
            match *state {
                Residency::Swapped(slot) => {
                    if let Some(swap) = vm.swap_store() {
                        swap.free_slot(slot);
                    }
                }
                Residency::Resident(frame) => {
                    if !vm.release_user_frame(frame, &pte) {
                        // An evictor claimed this frame between its clock
                        // scan and taking the entry lock. Leave a dead
                        // marker so it skips the write-out.
                        *state = Residency::Resident(FRAME_PENDING);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::test_support::make_vm;
    use crate::vm::FaultKind;

    const CODE_BASE: usize = 0x1000;

    fn loaded_aspace() -> AddressSpace {
        let mut aspace = AddressSpace::new();
        aspace.define_region(CODE_BASE, 2 * PAGE_FRAME_SIZE, true, false, true);
        aspace.complete_load();
        aspace
    }

    #[test]
    fn test_define_region_aligns() {
        let mut aspace = AddressSpace::new();
        aspace.define_region(0x1234, 100, true, true, false);
        let region = aspace.region_for(0x1000).expect("region covers base page");
        assert_eq!(region.start(), 0x1000);
        assert_eq!(region.len(), PAGE_FRAME_SIZE);
        assert!(aspace.region_for(0x2000).is_none());
    }

    #[test]
    fn test_heap_follows_last_segment() {
        let mut aspace = AddressSpace::new();
        aspace.define_region(0x1000, PAGE_FRAME_SIZE, true, false, true);
        aspace.define_region(0x4000, PAGE_FRAME_SIZE, true, true, false);
        aspace.complete_load();
        assert_eq!(aspace.heap_bounds(), (0x5000, 0x5000));
        // The empty heap region covers no addresses yet.
        assert!(aspace.region_for(0x5000).is_none());
    }

    #[test]
    fn test_define_stack() {
        let mut aspace = loaded_aspace();
        let sp = aspace.define_stack();
        assert_eq!(sp, USER_TOP);
        assert!(aspace.region_for(USER_TOP - 1).is_some());
        assert!(aspace
            .region_for(USER_TOP - USER_STACK_PAGES * PAGE_FRAME_SIZE)
            .is_some());
    }

    #[test]
    fn test_extend_heap() {
        let mut aspace = loaded_aspace();
        let (start, _) = aspace.heap_bounds();

        let old = aspace.extend_heap(100).expect("grow succeeds");
        assert_eq!(old, start);
        assert_eq!(aspace.heap_bounds(), (start, start + 100));
        // The heap region is rounded up to whole pages.
        assert!(aspace.region_for(start).is_some());
        assert!(aspace.region_for(start + PAGE_FRAME_SIZE - 1).is_some());

        let old = aspace.extend_heap(-50).expect("shrink succeeds");
        assert_eq!(old, start + 100);
        assert_eq!(aspace.heap_bounds(), (start, start + 50));

        // The break can never drop below the heap start.
        assert_eq!(
            aspace.extend_heap(-(PAGE_FRAME_SIZE as isize)),
            Err(VmError::SegmentationFault)
        );
    }

    #[test]
    fn test_copy_independence_without_swap() {
        let vm = make_vm(8, None);
        let aspace = loaded_aspace();

        vm.handle_fault(0, Some(&aspace), CODE_BASE, FaultKind::WRITE_CODE)
            .expect("first touch succeeds");
        let frame = match aspace.residency_of(CODE_BASE) {
            Some(Residency::Resident(frame)) => frame,
            other => panic!("expected resident entry, got {other:?}"),
        };
        unsafe { *vm.frame_ptr(frame) = 0x5A };

        let child = aspace.copy(vm).expect("copy succeeds");
        let child_frame = match child.residency_of(CODE_BASE) {
            Some(Residency::Resident(frame)) => frame,
            other => panic!("expected resident copy, got {other:?}"),
        };
        assert_ne!(frame, child_frame);
        unsafe {
            assert_eq!(*vm.frame_ptr(child_frame), 0x5A);
            // Writes to the parent do not show in the child, nor the
            // reverse.
            *vm.frame_ptr(frame) = 0x11;
            *vm.frame_ptr(child_frame) = 0x22;
            assert_eq!(*vm.frame_ptr(frame), 0x11);
            assert_eq!(*vm.frame_ptr(child_frame), 0x22);
        }

        let used_before = vm.used_bytes();
        child.destroy(vm);
        assert_eq!(vm.used_bytes(), used_before - PAGE_FRAME_SIZE);
        aspace.destroy(vm);
    }

    #[test]
    fn test_copy_independence_with_swap() {
        let vm = make_vm(8, Some(16));
        let aspace = loaded_aspace();

        vm.handle_fault(0, Some(&aspace), CODE_BASE, FaultKind::WRITE_CODE)
            .expect("first touch succeeds");
        let frame = match aspace.residency_of(CODE_BASE) {
            Some(Residency::Resident(frame)) => frame,
            other => panic!("expected resident entry, got {other:?}"),
        };
        unsafe { *vm.frame_ptr(frame) = 0x5A };

        let child = aspace.copy(vm).expect("copy succeeds");
        // With swapping, the child's pages land in swap slots.
        assert!(matches!(
            child.residency_of(CODE_BASE),
            Some(Residency::Swapped(_))
        ));
        // The source stays resident and evictable.
        assert!(matches!(
            aspace.residency_of(CODE_BASE),
            Some(Residency::Resident(_))
        ));

        // Mutate the parent, then fault the child's page back in.
        unsafe { *vm.frame_ptr(frame) = 0x11 };
        vm.handle_fault(0, Some(&child), CODE_BASE, FaultKind::READ_CODE)
            .expect("swap-in succeeds");
        let child_frame = match child.residency_of(CODE_BASE) {
            Some(Residency::Resident(frame)) => frame,
            other => panic!("expected resident child entry, got {other:?}"),
        };
        unsafe { assert_eq!(*vm.frame_ptr(child_frame), 0x5A) };

        child.destroy(vm);
        aspace.destroy(vm);
        assert_eq!(vm.swap_slots_in_use(), 0);
    }

    #[test]
    fn test_copy_of_swapped_entry() {
        // 1 user-usable frame forces the parent's page out before the copy.
        let vm = make_vm(1, Some(16));
        let parent = loaded_aspace();

        vm.handle_fault(0, Some(&parent), CODE_BASE, FaultKind::WRITE_CODE)
            .expect("first touch succeeds");
        let frame = match parent.residency_of(CODE_BASE) {
            Some(Residency::Resident(frame)) => frame,
            other => panic!("expected resident entry, got {other:?}"),
        };
        unsafe { *vm.frame_ptr(frame) = 0x77 };

        // Faulting a second page evicts the first.
        vm.handle_fault(
            0,
            Some(&parent),
            CODE_BASE + PAGE_FRAME_SIZE,
            FaultKind::WRITE_CODE,
        )
        .expect("fault with eviction succeeds");
        assert!(matches!(
            parent.residency_of(CODE_BASE),
            Some(Residency::Swapped(_))
        ));

        let child = parent.copy(vm).expect("copy succeeds");
        let (parent_slot, child_slot) = match (
            parent.residency_of(CODE_BASE),
            child.residency_of(CODE_BASE),
        ) {
            (Some(Residency::Swapped(a)), Some(Residency::Swapped(b))) => (a, b),
            other => panic!("expected two swapped entries, got {other:?}"),
        };
        assert_ne!(parent_slot, child_slot);

        parent.destroy(vm);

        // The child's copy survives its parent: fault it in and check.
        vm.handle_fault(0, Some(&child), CODE_BASE, FaultKind::READ_CODE)
            .expect("swap-in succeeds");
        let child_frame = match child.residency_of(CODE_BASE) {
            Some(Residency::Resident(frame)) => frame,
            other => panic!("expected resident child entry, got {other:?}"),
        };
        unsafe { assert_eq!(*vm.frame_ptr(child_frame), 0x77) };

        child.destroy(vm);
        assert_eq!(vm.swap_slots_in_use(), 0);
        assert_eq!(vm.used_bytes(), 0);
    }

    #[test]
    fn test_destroy_releases_everything() {
        let vm = make_vm(4, Some(8));
        let mut aspace = AddressSpace::new();
        aspace.define_region(CODE_BASE, 2 * PAGE_FRAME_SIZE, true, true, false);
        aspace.complete_load();

        vm.handle_fault(0, Some(&aspace), CODE_BASE, FaultKind::WRITE_CODE)
            .expect("first touch succeeds");
        vm.handle_fault(
            0,
            Some(&aspace),
            CODE_BASE + PAGE_FRAME_SIZE,
            FaultKind::WRITE_CODE,
        )
        .expect("first touch succeeds");
        assert_eq!(vm.used_bytes(), 2 * PAGE_FRAME_SIZE);

        aspace.destroy(vm);
        assert_eq!(vm.used_bytes(), 0);
        assert_eq!(vm.swap_slots_in_use(), 0);
    }

    #[test]
    fn test_copy_fails_cleanly_when_out_of_swap() {
        // Two resident pages but swap only fits one.
        let vm = make_vm(4, Some(1));
        let mut aspace = AddressSpace::new();
        aspace.define_region(CODE_BASE, 2 * PAGE_FRAME_SIZE, true, true, false);
        aspace.complete_load();

        for page in 0..2 {
            vm.handle_fault(
                0,
                Some(&aspace),
                CODE_BASE + page * PAGE_FRAME_SIZE,
                FaultKind::WRITE_CODE,
            )
            .expect("first touch succeeds");
        }

        match aspace.copy(vm) {
            Err(e) => assert_eq!(e, VmError::OutOfSwapSpace),
            Ok(_) => panic!("copy should have run out of swap"),
        }
        // The partial copy was torn down: no leaked slots, and the
        // parent's frames are untouched.
        assert_eq!(vm.swap_slots_in_use(), 0);
        assert_eq!(vm.used_bytes(), 2 * PAGE_FRAME_SIZE);
        aspace.destroy(vm);
    }
}
