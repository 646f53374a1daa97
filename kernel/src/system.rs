//! One-time construction of the VM subsystem.
//!
//! The kernel entry builds a [`VmSystem`] during bootstrap and parks it
//! here; everything downstream receives `&'static VmSystem` instead of
//! reaching for mutable global state. Tests construct their own
//! [`VmSystem`] directly and never touch this.

use crate::vm::VmSystem;
use alloc::boxed::Box;
use once_cell::race::OnceBox;

static VM: OnceBox<VmSystem> = OnceBox::new();

/// Publishes the bootstrapped subsystem. Panics on a second call.
pub fn init(vm: VmSystem) -> &'static VmSystem {
    assert!(
        VM.set(Box::new(vm)).is_ok(),
        "vm subsystem initialized twice"
    );
    vm_ref()
}

/// The subsystem handle. Panics before [`init`].
pub fn vm_ref() -> &'static VmSystem {
    VM.get().expect("vm subsystem not initialized")
}

/// Whether bootstrap has run; lets early code degrade gracefully.
pub fn initialized() -> bool {
    VM.get().is_some()
}
