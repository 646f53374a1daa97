//! Failure taxonomy of the virtual-memory subsystem.

use crate::block::DeviceError;
use core::error::Error;
use core::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmError {
    /// No free frame and no evictable frame available
    OutOfMemory,
    /// Swap slot allocation exhausted
    OutOfSwapSpace,
    /// Address outside every region (or no active address space)
    SegmentationFault,
    /// Unrecognized hardware fault code
    InvalidFaultKind,
    /// Propagated verbatim from the backing device
    DeviceIo(DeviceError),
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::OutOfMemory => write!(f, "out of memory"),
            VmError::OutOfSwapSpace => write!(f, "out of swap space"),
            VmError::SegmentationFault => write!(f, "segmentation fault"),
            VmError::InvalidFaultKind => write!(f, "invalid fault kind"),
            VmError::DeviceIo(e) => write!(f, "swap device error: {e}"),
        }
    }
}

impl Error for VmError {}

impl From<DeviceError> for VmError {
    fn from(e: DeviceError) -> Self {
        VmError::DeviceIo(e)
    }
}
