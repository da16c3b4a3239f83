//! Memory-Mapped Files
//!
//! Per-process table grouping the lazy page entries that share one file
//! mapping. The descriptor keeps its own re-opened handle so a user-level
//! close of the mapped fd cannot break the mapping.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::fs::File;
use crate::memory::frame::FrameTable;
use crate::memory::page::{PageBacking, PageEntry};
use crate::memory::swap::SwapManager;
use crate::memory::{is_page_aligned, VmError, PAGE_SIZE, STACK_MIN};
use crate::process::Process;

/// Map region identifier, dense per process
pub type MapId = i32;

/// Sentinel returned by a failed `mmap`
pub const MAP_FAILED: MapId = -1;

/// One live mapping: the backing handle and its pages in address order.
pub struct MmapFile {
    pub mapid: MapId,
    pub file: File,
    pub pages: Vec<u64>,
}

/// Per-process mapping table keyed by map id.
pub struct MmapTable {
    maps: BTreeMap<MapId, MmapFile>,
}

impl MmapTable {
    pub fn new() -> Self {
        MmapTable {
            maps: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, mm: MmapFile) {
        self.maps.insert(mm.mapid, mm);
    }

    pub fn get(&self, mapid: MapId) -> Option<&MmapFile> {
        self.maps.get(&mapid)
    }

    pub fn remove(&mut self, mapid: MapId) -> Option<MmapFile> {
        self.maps.remove(&mapid)
    }

    /// Live map ids, for exit-time teardown.
    pub fn ids(&self) -> Vec<MapId> {
        self.maps.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

impl Default for MmapTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Record a file mapping at `addr`, one lazy writable page per file page.
///
/// `file` is the descriptor's own re-opened handle. All preconditions are
/// checked before the first page entry is created, so a failure leaves the
/// supplemental page table untouched.
pub fn map_file(proc: &mut Process, file: File, addr: u64) -> Result<MapId, VmError> {
    let len = file.length();
    if len == 0 || addr == 0 || !is_page_aligned(addr) {
        return Err(VmError::BadAccess);
    }

    let page_count = (len as usize + PAGE_SIZE - 1) / PAGE_SIZE;
    let span = (page_count * PAGE_SIZE) as u64;
    let end = addr.checked_add(span).ok_or(VmError::BadAccess)?;
    // The region reserved for the stack is off limits.
    if end > STACK_MIN {
        return Err(VmError::BadAccess);
    }
    for i in 0..page_count {
        let upage = addr + (i * PAGE_SIZE) as u64;
        if proc.spt.lookup(upage).is_some() {
            return Err(VmError::Duplicate);
        }
    }

    let mapid = proc.next_mapid;
    proc.next_mapid += 1;

    let mut pages = Vec::with_capacity(page_count);
    for i in 0..page_count {
        let upage = addr + (i * PAGE_SIZE) as u64;
        let offset = (i * PAGE_SIZE) as u64;
        let read_bytes = PAGE_SIZE.min((len - offset) as usize);
        let entry = PageEntry::file_mapped(
            upage,
            proc.pid,
            file.reopen(),
            true,
            offset,
            read_bytes,
            PAGE_SIZE - read_bytes,
        );
        proc.spt.insert(entry)?;
        pages.push(upage);
    }

    proc.mmaps.insert(MmapFile { mapid, file, pages });
    crate::log_debug!(
        "[MMAP] pid={} mapped {} pages at {:#x} as map {}",
        proc.pid,
        page_count,
        addr,
        mapid
    );
    Ok(mapid)
}

/// Tear down one mapping: write dirty resident pages back to the file,
/// release their frames and MMU mappings, delete the page entries, close
/// the handle. Pages already evicted clean need no work.
pub fn unmap(
    frames: &mut FrameTable,
    proc: &mut Process,
    swap: &SwapManager,
    mapid: MapId,
) -> Result<(), VmError> {
    let mm = proc.mmaps.remove(mapid).ok_or(VmError::BadAccess)?;

    for &upage in &mm.pages {
        let mut resident = None;
        if let Some(entry) = proc.spt.lookup(upage) {
            if let Some(idx) = entry.frame {
                if proc.pagedir.is_dirty(upage) {
                    if let PageBacking::FileMapped(fb) = &entry.backing {
                        fb.file
                            .write_at(&frames.bytes(idx)[..fb.read_bytes], fb.offset);
                    }
                }
                resident = Some(idx);
            }
        }
        if let Some(idx) = resident {
            frames.free(idx);
            proc.pagedir.clear(upage);
        }
        proc.spt.remove(upage, swap);
    }

    crate::log_debug!("[MMAP] pid={} unmapped map {}", proc.pid, mapid);
    // mm.file drops here, closing the re-opened handle.
    Ok(())
}
