//! Swap Manager
//!
//! Page-sized slots on the swap block device, tracked by a word bitmap
//! behind its own mutex. Slot allocation is serialised by that mutex; the
//! sector I/O itself is not, so writes to different slots may overlap.
//! Callers keep the frame pinned for the duration of slot I/O.
//!
//! Initialised once at boot when a swap device is present; a missing device
//! or an oversized bitmap is fatal.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::block::{BlockDevice, SECTOR_SIZE};
use crate::memory::{VmError, PAGE_SIZE};

/// Sectors per swap slot
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// Largest supported swap device (slots); 256 MB of swap
const MAX_SWAP_SLOTS: usize = 65536;

/// Swap slot index
pub type SwapSlot = u32;

struct SlotBitmap {
    /// One bit per slot, set = in use
    words: Vec<u64>,
    slots: usize,
    used: usize,
}

impl SlotBitmap {
    fn scan_and_flip(&mut self) -> Option<SwapSlot> {
        for (idx, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let slot = idx * 64 + bit;
            if slot >= self.slots {
                continue;
            }
            *word |= 1u64 << bit;
            self.used += 1;
            return Some(slot as SwapSlot);
        }
        None
    }

    fn clear(&mut self, slot: SwapSlot) {
        let idx = slot as usize / 64;
        let bit = slot as usize % 64;
        debug_assert!(
            self.words[idx] & (1u64 << bit) != 0,
            "freeing a free swap slot"
        );
        if self.words[idx] & (1u64 << bit) != 0 {
            self.words[idx] &= !(1u64 << bit);
            self.used -= 1;
        }
    }
}

/// Swap slot allocator and slot I/O.
pub struct SwapManager {
    device: Box<dyn BlockDevice>,
    map: Mutex<SlotBitmap>,
    swapped_out: AtomicU64,
    swapped_in: AtomicU64,
}

impl SwapManager {
    /// Size the bitmap from the device capacity.
    ///
    /// # Panics
    /// With no device, or with a device too large for the slot bitmap.
    /// Both are boot-time conditions.
    pub fn new(device: Option<Box<dyn BlockDevice>>) -> Self {
        let device = match device {
            Some(d) => d,
            None => panic!("couldn't open swap device"),
        };
        let slots = device.size_in_sectors() as usize / SECTORS_PER_PAGE;
        if slots == 0 || slots > MAX_SWAP_SLOTS {
            panic!("swap bitmap creation failed: device holds {} slots", slots);
        }
        let words = (slots + 63) / 64;
        crate::log!(
            "[SWAP] {} slots ({} KB) on swap device",
            slots,
            slots * PAGE_SIZE / 1024
        );
        SwapManager {
            device,
            map: Mutex::new(SlotBitmap {
                words: vec![0u64; words],
                slots,
                used: 0,
            }),
            swapped_out: AtomicU64::new(0),
            swapped_in: AtomicU64::new(0),
        }
    }

    /// Write one page of bytes to a fresh slot.
    pub fn write_page(&self, page: &[u8]) -> Result<SwapSlot, VmError> {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        let slot = self
            .map
            .lock()
            .scan_and_flip()
            .ok_or(VmError::SwapFull)?;
        let base = slot as u64 * SECTORS_PER_PAGE as u64;
        for i in 0..SECTORS_PER_PAGE {
            self.device
                .write_sector(base + i as u64, &page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
        }
        self.swapped_out.fetch_add(1, Ordering::Relaxed);
        Ok(slot)
    }

    /// Read a slot's page into `dst`. The slot stays allocated; the caller
    /// frees it once the page is resident again.
    pub fn read_page(&self, slot: SwapSlot, dst: &mut [u8]) {
        debug_assert_eq!(dst.len(), PAGE_SIZE);
        let base = slot as u64 * SECTORS_PER_PAGE as u64;
        for i in 0..SECTORS_PER_PAGE {
            self.device
                .read_sector(base + i as u64, &mut dst[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
        }
        self.swapped_in.fetch_add(1, Ordering::Relaxed);
    }

    /// Release a slot.
    pub fn free(&self, slot: SwapSlot) {
        self.map.lock().clear(slot);
    }

    /// Total slots on the device
    pub fn total_slots(&self) -> usize {
        self.map.lock().slots
    }

    /// Slots currently allocated
    pub fn used_slots(&self) -> usize {
        self.map.lock().used
    }

    /// (pages swapped out, pages swapped in) since boot
    pub fn stats(&self) -> (u64, u64) {
        (
            self.swapped_out.load(Ordering::Relaxed),
            self.swapped_in.load(Ordering::Relaxed),
        )
    }
}
