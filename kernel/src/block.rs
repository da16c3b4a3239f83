//! Block Device Interface
//!
//! Sector-granular storage as seen by the swap manager. The driver behind
//! the trait is out of scope; a RAM-backed device is provided for boots
//! without real hardware and for the test suite.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

/// Disk sector size
pub const SECTOR_SIZE: usize = 512;

/// A device addressable in fixed-size sectors.
pub trait BlockDevice: Send + Sync {
    /// Device capacity in sectors
    fn size_in_sectors(&self) -> u64;
    /// Read one sector into `dst` (`dst.len() == SECTOR_SIZE`)
    fn read_sector(&self, idx: u64, dst: &mut [u8]);
    /// Write one sector from `src` (`src.len() == SECTOR_SIZE`)
    fn write_sector(&self, idx: u64, src: &[u8]);
}

/// RAM-backed block device
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
    sectors: u64,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl RamDisk {
    /// Allocate a zeroed device of `sectors` sectors.
    pub fn new(sectors: u64) -> Self {
        RamDisk {
            data: Mutex::new(vec![0u8; sectors as usize * SECTOR_SIZE]),
            sectors,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Return (sectors read, sectors written) so far.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.reads.load(Ordering::Relaxed),
            self.writes.load(Ordering::Relaxed),
        )
    }
}

impl BlockDevice for RamDisk {
    fn size_in_sectors(&self) -> u64 {
        self.sectors
    }

    fn read_sector(&self, idx: u64, dst: &mut [u8]) {
        assert!(idx < self.sectors, "sector index out of range");
        assert_eq!(dst.len(), SECTOR_SIZE);
        let data = self.data.lock();
        let off = idx as usize * SECTOR_SIZE;
        dst.copy_from_slice(&data[off..off + SECTOR_SIZE]);
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn write_sector(&self, idx: u64, src: &[u8]) {
        assert!(idx < self.sectors, "sector index out of range");
        assert_eq!(src.len(), SECTOR_SIZE);
        let mut data = self.data.lock();
        let off = idx as usize * SECTOR_SIZE;
        data[off..off + SECTOR_SIZE].copy_from_slice(src);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}
