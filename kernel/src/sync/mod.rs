pub mod intr;
pub mod sleep;
pub mod spin;

pub use intr::{IrqLock, IrqLockGuard};
pub use sleep::{SleepLock, SleepLockGuard};
pub use spin::{SpinLock, SpinLockGuard};
