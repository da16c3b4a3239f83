//! Frame Table
//!
//! Process-global arena of user-pool frames. The arena index doubles as the
//! kernel address of the frame, and arena order is the eviction order.
//! Victim selection is second chance: a rotating cursor skips pinned
//! frames, gives accessed frames one more pass, and otherwise evicts.
//!
//! What eviction does with the victim depends on its backing: clean
//! executable and clean mmap pages are dropped, dirty mmap pages go back to
//! their file, everything else goes to swap. A dirty executable page is
//! promoted to anonymous on its way out and stays swap-backed forever.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use crate::memory::page::PageBacking;
use crate::memory::swap::SwapManager;
use crate::memory::{VmError, PAGE_SIZE};
use crate::process::{Pid, Process};
use crate::vm::VmState;

/// One user-pool frame.
pub struct Frame {
    data: Vec<u8>,
    /// Process whose page this frame backs
    pub owner: Pid,
    /// User page backed by this frame
    pub upage: u64,
    /// Pinned frames are never eviction victims
    pub pinned: bool,
}

/// The user-pool frame arena.
pub struct FrameTable {
    slots: Vec<Option<Frame>>,
    /// Second-chance cursor
    clock: usize,
    evictions: u64,
    peak: usize,
}

impl FrameTable {
    /// Arena with a fixed pool of `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        FrameTable {
            slots,
            clock: 0,
            evictions: 0,
            peak: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Frames currently in use
    pub fn used(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// (evictions so far, peak frames in use)
    pub fn stats(&self) -> (u64, usize) {
        (self.evictions, self.peak)
    }

    pub fn get(&self, idx: usize) -> Option<&Frame> {
        self.slots.get(idx)?.as_ref()
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Frame> {
        self.slots.get_mut(idx)?.as_mut()
    }

    /// Contents of a live frame.
    pub fn bytes(&self, idx: usize) -> &[u8] {
        &self.slots[idx].as_ref().expect("frame not in use").data
    }

    pub fn bytes_mut(&mut self, idx: usize) -> &mut [u8] {
        &mut self.slots[idx].as_mut().expect("frame not in use").data
    }

    pub fn set_pinned(&mut self, idx: usize, pinned: bool) {
        self.slots[idx].as_mut().expect("frame not in use").pinned = pinned;
    }

    /// Take a free slot if one exists. The new frame is zeroed and pinned;
    /// the caller unpins after installing the mapping and the contents.
    pub fn alloc(&mut self, owner: Pid, upage: u64) -> Option<usize> {
        let idx = self.slots.iter().position(|s| s.is_none())?;
        self.slots[idx] = Some(Frame {
            data: vec![0u8; PAGE_SIZE],
            owner,
            upage,
            pinned: true,
        });
        self.peak = self.peak.max(self.used());
        Some(idx)
    }

    /// Release a frame slot.
    pub fn free(&mut self, idx: usize) {
        debug_assert!(self.slots[idx].is_some(), "freeing a free frame");
        self.slots[idx] = None;
    }

    /// Second-chance scan for an eviction victim.
    ///
    /// Fails with `OutOfMemory` when no unpinned frame (with a live owner)
    /// exists; otherwise the scan terminates within two rotations.
    pub fn select_victim(
        &mut self,
        procs: &mut BTreeMap<Pid, Process>,
    ) -> Result<usize, VmError> {
        let n = self.slots.len();
        let evictable = self.slots.iter().any(|s| {
            s.as_ref()
                .map_or(false, |f| !f.pinned && procs.contains_key(&f.owner))
        });
        if !evictable {
            return Err(VmError::OutOfMemory);
        }

        loop {
            let idx = self.clock;
            self.clock = (self.clock + 1) % n;

            let Some(frame) = self.slots[idx].as_ref() else {
                continue;
            };
            if frame.pinned {
                continue;
            }
            let (owner, upage) = (frame.owner, frame.upage);
            let Some(proc) = procs.get_mut(&owner) else {
                continue;
            };
            if proc.pagedir.is_accessed(upage) {
                proc.pagedir.set_accessed(upage, false);
            } else {
                return Ok(idx);
            }
        }
    }
}

/// Get a pinned frame for `upage`, evicting if the pool is exhausted.
pub fn acquire(
    state: &mut VmState,
    swap: &SwapManager,
    owner: Pid,
    upage: u64,
) -> Result<usize, VmError> {
    loop {
        let VmState { frames, procs } = state;
        if let Some(idx) = frames.alloc(owner, upage) {
            return Ok(idx);
        }
        let victim = frames.select_victim(procs)?;
        evict(state, swap, victim)?;
    }
}

/// Push one victim frame out of the pool.
pub fn evict(state: &mut VmState, swap: &SwapManager, victim: usize) -> Result<(), VmError> {
    let VmState { frames, procs } = state;

    let (owner, upage) = {
        let frame = frames.get(victim).expect("evicting a free frame");
        debug_assert!(!frame.pinned, "evicting a pinned frame");
        (frame.owner, frame.upage)
    };
    // Pinned while its bytes are in flight to swap or the file.
    frames.set_pinned(victim, true);
    let proc = procs.get_mut(&owner).expect("victim frame has no owner");
    let dirty = proc.pagedir.is_dirty(upage);
    let entry = proc
        .spt
        .lookup_mut(upage)
        .expect("victim frame has no page entry");

    let written: Result<(), VmError> = match &mut entry.backing {
        // Clean image page: drop it, the next fault rereads the file.
        PageBacking::Executable(_) if !dirty => Ok(()),
        // Dirty image page: promote to anonymous, swap backed from now on.
        PageBacking::Executable(_) => match swap.write_page(frames.bytes(victim)) {
            Ok(slot) => {
                entry.backing = PageBacking::Anonymous { slot: Some(slot) };
                Ok(())
            }
            Err(e) => Err(e),
        },
        // Mmap page: dirty contents return to the file, never to swap.
        PageBacking::FileMapped(fb) => {
            if dirty {
                fb.file
                    .write_at(&frames.bytes(victim)[..fb.read_bytes], fb.offset);
            }
            Ok(())
        }
        PageBacking::Anonymous { slot } => match swap.write_page(frames.bytes(victim)) {
            Ok(s) => {
                *slot = Some(s);
                Ok(())
            }
            Err(e) => Err(e),
        },
    };
    if let Err(e) = written {
        frames.set_pinned(victim, false);
        return Err(e);
    }

    entry.frame = None;
    proc.pagedir.clear(upage);
    frames.free(victim);
    frames.evictions += 1;
    crate::log_debug!("[FRAME] evicted pid={} upage={:#x}", owner, upage);
    Ok(())
}
