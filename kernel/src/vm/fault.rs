//! The page-fault handler: classifies a translation-miss trap, resolves or
//! creates the mapping, and installs it into the translation cache.

use super::addrspace::{AddressSpace, PageTableEntry, Residency};
use super::coremap::FrameStatus;
use super::error::VmError;
use super::{VmSystem, FRAME_PENDING};
use alloc::sync::Arc;
use marrowos_shared::mem::page_align_down;

/// The access kind reported by the translation hardware.
///
/// All three kinds are currently handled the same way: read-only
/// enforcement is not implemented and every installed mapping is writable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    Write,
    ReadOnly,
}

impl FaultKind {
    pub const READ_CODE: u32 = 0;
    pub const WRITE_CODE: u32 = 1;
    pub const READONLY_CODE: u32 = 2;

    pub const fn from_code(code: u32) -> Option<FaultKind> {
        match code {
            Self::READ_CODE => Some(FaultKind::Read),
            Self::WRITE_CODE => Some(FaultKind::Write),
            Self::READONLY_CODE => Some(FaultKind::ReadOnly),
            _ => None,
        }
    }
}

impl VmSystem {
    /// Resolves a translation-miss trap on `cpu` at `faultaddress`.
    ///
    /// `aspace` is the faulting thread's current address space, or `None`
    /// if no process is active. On error the caller signals the condition
    /// as fatal to the owning process; this subsystem only reports it.
    pub fn handle_fault(
        &self,
        cpu: usize,
        aspace: Option<&AddressSpace>,
        faultaddress: usize,
        fault_code: u32,
    ) -> Result<(), VmError> {
        // Reject unknown fault codes before touching any state.
        let _kind = FaultKind::from_code(fault_code).ok_or(VmError::InvalidFaultKind)?;
        let aspace = aspace.ok_or(VmError::SegmentationFault)?;

        let page = page_align_down(faultaddress);
        if aspace.region_for(page).is_none() {
            return Err(VmError::SegmentationFault);
        }

        let existing = aspace.entries.lock().get(&page).cloned();
        match existing {
            Some(pte) => self.resolve_existing(cpu, &pte),
            None => self.first_touch(cpu, aspace, page),
        }
    }

    fn resolve_existing(&self, cpu: usize, pte: &Arc<PageTableEntry>) -> Result<(), VmError> {
        let mut state = pte.state().lock();
        match *state {
            Residency::Resident(frame) => {
                self.tlb().install(cpu, pte.virtual_page(), frame);
                self.touch_frame(frame);
                Ok(())
            }
            Residency::Swapped(slot) => {
                let Some(swap) = self.swap_store() else {
                    unreachable!("swapped entry while swapping is disabled")
                };
                // May itself evict an unrelated frame; that victim cannot be
                // this page, which owns no frame while swapped.
                let frame =
                    self.allocate_frames(1, FrameStatus::Transit, Some(Arc::downgrade(pte)))?;
                // SAFETY: the frame is ours (Transit) until installed.
                if let Err(e) = unsafe { swap.read_page(slot, self.frame_ptr(frame)) } {
                    self.free_run(frame);
                    return Err(e);
                }
                *state = Residency::Resident(frame);
                self.tlb().install(cpu, pte.virtual_page(), frame);
                self.finish_user_frame(frame);
                // Nobody can observe a half-done transition: the entry lock
                // is released only now that the mapping is installed.
                drop(state);
                swap.free_slot(slot);
                Ok(())
            }
        }
    }

    fn first_touch(&self, cpu: usize, aspace: &AddressSpace, page: usize) -> Result<(), VmError> {
        let mut map = aspace.entries.lock();
        // A concurrent fault may have created the entry since our lookup.
        if let Some(pte) = map.get(&page).cloned() {
            drop(map);
            return self.resolve_existing(cpu, &pte);
        }

        let pte = Arc::new(PageTableEntry::new(page, Residency::Resident(FRAME_PENDING)));
        map.insert(page, pte.clone());
        // Still under the map lock, so this cannot block; a concurrent
        // fault on this page will wait on the entry lock instead of seeing
        // the pending placeholder.
        let mut state = pte.state().lock();
        drop(map);

        match self.allocate_frames(1, FrameStatus::Transit, Some(Arc::downgrade(&pte))) {
            Ok(frame) => {
                *state = Residency::Resident(frame);
                self.tlb().install(cpu, page, frame);
                self.finish_user_frame(frame);
                Ok(())
            }
            Err(e) => {
                drop(state);
                aspace.entries.lock().remove(&page);
                Err(e)
            }
        }
    }
}
