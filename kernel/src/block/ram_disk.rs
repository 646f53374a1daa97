//! A memory-backed block device, used as the swap store in hosted tests and
//! early bring-up before a real disk driver is attached.

use super::device::{BlockDevice, DeviceError, PageBuf};
use crate::sync::SleepLock;
use alloc::boxed::Box;
use alloc::vec;
use marrowos_shared::mem::{page_offset, PAGE_FRAME_SIZE};

pub struct RamDisk {
    data: SleepLock<Box<[u8]>>,
    size: usize,
}

impl RamDisk {
    pub fn new(pages: usize) -> Self {
        let size = pages * PAGE_FRAME_SIZE;
        Self {
            data: SleepLock::new(vec![0; size].into_boxed_slice()),
            size,
        }
    }

    fn check_offset(&self, offset: usize) -> Result<(), DeviceError> {
        if page_offset(offset) != 0 || offset + PAGE_FRAME_SIZE > self.size {
            return Err(DeviceError::OffsetOutOfBounds);
        }
        Ok(())
    }
}

impl BlockDevice for RamDisk {
    fn size_bytes(&self) -> usize {
        self.size
    }

    fn read_page(&self, offset: usize, dst: &mut PageBuf) -> Result<(), DeviceError> {
        self.check_offset(offset)?;
        let data = self.data.lock();
        dst.copy_from_slice(&data[offset..offset + PAGE_FRAME_SIZE]);
        Ok(())
    }

    fn write_page(&self, offset: usize, src: &PageBuf) -> Result<(), DeviceError> {
        self.check_offset(offset)?;
        let mut data = self.data.lock();
        data[offset..offset + PAGE_FRAME_SIZE].copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let disk = RamDisk::new(4);
        let mut page = [0u8; PAGE_FRAME_SIZE];
        page[0] = 0xAB;
        page[PAGE_FRAME_SIZE - 1] = 0xCD;

        disk.write_page(2 * PAGE_FRAME_SIZE, &page)
            .expect("write in bounds");

        let mut read = [0u8; PAGE_FRAME_SIZE];
        disk.read_page(2 * PAGE_FRAME_SIZE, &mut read)
            .expect("read in bounds");
        assert_eq!(read[0], 0xAB);
        assert_eq!(read[PAGE_FRAME_SIZE - 1], 0xCD);

        // Untouched pages stay zeroed.
        disk.read_page(0, &mut read).expect("read in bounds");
        assert!(read.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_bad_offsets() {
        let disk = RamDisk::new(2);
        let page = [0u8; PAGE_FRAME_SIZE];
        assert_eq!(
            disk.write_page(1, &page),
            Err(DeviceError::OffsetOutOfBounds)
        );
        assert_eq!(
            disk.write_page(2 * PAGE_FRAME_SIZE, &page),
            Err(DeviceError::OffsetOutOfBounds)
        );
    }
}
