//! Supplemental Page Table
//!
//! Per-process map from a user page to the description of its backing.
//! The hardware page table only knows about resident pages; everything the
//! fault handler needs to materialize a missing page lives here.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::fs::File;
use crate::memory::swap::{SwapManager, SwapSlot};
use crate::memory::{page_down, VmError, PAGE_SIZE};
use crate::process::Pid;

/// File region behind an EXECUTABLE or FILE_MAPPED page.
///
/// `read_bytes` come from the file at `offset`; the remaining
/// `zero_bytes = PAGE_SIZE - read_bytes` are zero filled.
pub struct FileBacking {
    pub file: File,
    pub offset: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

/// What a page's contents come from when it is not resident.
///
/// An EXECUTABLE page that is evicted dirty is promoted to ANONYMOUS; the
/// promotion is a variant change, so the stale file region is unreachable
/// afterwards. FILE_MAPPED pages never own a swap slot: dirty contents go
/// back to the file.
pub enum PageBacking {
    /// Program image page, lazily read from the executable
    Executable(FileBacking),
    /// `mmap` page, written back to the file on dirty eviction
    FileMapped(FileBacking),
    /// Stack or promoted data page; `slot` is set while swapped out,
    /// `None` means zero fill on first fault
    Anonymous { slot: Option<SwapSlot> },
}

/// One supplemental page table entry.
pub struct PageEntry {
    pub upage: u64,
    pub owner: Pid,
    pub writable: bool,
    pub backing: PageBacking,
    /// Frame arena index while resident
    pub frame: Option<usize>,
}

impl PageEntry {
    pub fn executable(
        upage: u64,
        owner: Pid,
        file: File,
        writable: bool,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
    ) -> Self {
        debug_assert_eq!(read_bytes + zero_bytes, PAGE_SIZE);
        PageEntry {
            upage,
            owner,
            writable,
            backing: PageBacking::Executable(FileBacking {
                file,
                offset,
                read_bytes,
                zero_bytes,
            }),
            frame: None,
        }
    }

    pub fn file_mapped(
        upage: u64,
        owner: Pid,
        file: File,
        writable: bool,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
    ) -> Self {
        debug_assert_eq!(read_bytes + zero_bytes, PAGE_SIZE);
        PageEntry {
            upage,
            owner,
            writable,
            backing: PageBacking::FileMapped(FileBacking {
                file,
                offset,
                read_bytes,
                zero_bytes,
            }),
            frame: None,
        }
    }

    /// Zero-filled anonymous page (stack growth).
    pub fn anonymous(upage: u64, owner: Pid) -> Self {
        PageEntry {
            upage,
            owner,
            writable: true,
            backing: PageBacking::Anonymous { slot: None },
            frame: None,
        }
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    pub fn in_swap(&self) -> bool {
        matches!(self.backing, PageBacking::Anonymous { slot: Some(_) })
    }
}

/// Per-process supplemental page table, keyed by page-aligned user address.
pub struct SuppPageTable {
    entries: BTreeMap<u64, PageEntry>,
}

impl SuppPageTable {
    pub fn new() -> Self {
        SuppPageTable {
            entries: BTreeMap::new(),
        }
    }

    /// Find the entry covering `va`; only the page-aligned prefix is used.
    pub fn lookup(&self, va: u64) -> Option<&PageEntry> {
        self.entries.get(&page_down(va))
    }

    pub fn lookup_mut(&mut self, va: u64) -> Option<&mut PageEntry> {
        self.entries.get_mut(&page_down(va))
    }

    /// Insert a new entry; the page must not already be mapped.
    pub fn insert(&mut self, entry: PageEntry) -> Result<(), VmError> {
        debug_assert_eq!(entry.upage, page_down(entry.upage));
        if self.entries.contains_key(&entry.upage) {
            return Err(VmError::Duplicate);
        }
        self.entries.insert(entry.upage, entry);
        Ok(())
    }

    /// Create and insert a lazily file-backed page.
    #[allow(clippy::too_many_arguments)]
    pub fn create_file_backed(
        &mut self,
        upage: u64,
        owner: Pid,
        file: File,
        writable: bool,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        executable: bool,
    ) -> Result<(), VmError> {
        let entry = if executable {
            PageEntry::executable(upage, owner, file, writable, offset, read_bytes, zero_bytes)
        } else {
            PageEntry::file_mapped(upage, owner, file, writable, offset, read_bytes, zero_bytes)
        };
        self.insert(entry)
    }

    /// Drop the entry for `va`, releasing any swap slot it owns. The MMU
    /// mapping and any backing frame are the caller's to clean up.
    pub fn remove(&mut self, va: u64, swap: &SwapManager) -> Option<PageEntry> {
        let entry = self.entries.remove(&page_down(va))?;
        if let PageBacking::Anonymous { slot: Some(slot) } = &entry.backing {
            swap.free(*slot);
        }
        Some(entry)
    }

    /// All mapped page addresses, for teardown walks.
    pub fn pages(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageEntry> {
        self.entries.values()
    }
}

impl Default for SuppPageTable {
    fn default() -> Self {
        Self::new()
    }
}
