//! Page Directory Oracle
//!
//! The hardware page table is out of scope; the VM layer sees it through
//! the `PageDir` trait as a per-process mapping oracle with accessed and
//! dirty bits. `kpage` values are indices into the frame arena.
//!
//! `SoftPageDir` is the reference implementation: a software page table
//! the tests (and boots without a real MMU driver) run against.

use alloc::collections::BTreeMap;

/// Soft PTE flag bits
#[derive(Clone, Copy, Debug)]
#[repr(transparent)]
pub struct PteFlags(u64);

impl PteFlags {
    pub const WRITABLE: u64 = 1 << 1;
    pub const ACCESSED: u64 = 1 << 5;
    pub const DIRTY: u64 = 1 << 6;

    pub const fn new(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    pub fn has(&self, bit: u64) -> bool {
        self.0 & bit != 0
    }

    pub fn set(&mut self, bit: u64, yes: bool) {
        if yes {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

/// Per-process MMU mapping oracle.
///
/// `upage` arguments must be page-aligned. Install fails when the page is
/// already mapped; the fault path treats that as a hard error.
pub trait PageDir: Send {
    fn install(&mut self, upage: u64, kpage: usize, writable: bool) -> bool;
    fn clear(&mut self, upage: u64);
    fn lookup(&self, upage: u64) -> Option<usize>;
    fn is_accessed(&self, upage: u64) -> bool;
    fn set_accessed(&mut self, upage: u64, yes: bool);
    fn is_dirty(&self, upage: u64) -> bool;
    fn set_dirty(&mut self, upage: u64, yes: bool);
    /// Whether user writes are permitted by the installed mapping
    fn is_writable(&self, upage: u64) -> bool;
}

struct SoftPte {
    kpage: usize,
    flags: PteFlags,
}

/// Software page directory
pub struct SoftPageDir {
    ptes: BTreeMap<u64, SoftPte>,
}

impl SoftPageDir {
    pub fn new() -> Self {
        SoftPageDir {
            ptes: BTreeMap::new(),
        }
    }

    /// Number of live mappings
    pub fn mapped_count(&self) -> usize {
        self.ptes.len()
    }
}

impl Default for SoftPageDir {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDir for SoftPageDir {
    fn install(&mut self, upage: u64, kpage: usize, writable: bool) -> bool {
        if self.ptes.contains_key(&upage) {
            return false;
        }
        let mut flags = PteFlags::new(0);
        flags.set(PteFlags::WRITABLE, writable);
        self.ptes.insert(upage, SoftPte { kpage, flags });
        true
    }

    fn clear(&mut self, upage: u64) {
        self.ptes.remove(&upage);
    }

    fn lookup(&self, upage: u64) -> Option<usize> {
        self.ptes.get(&upage).map(|pte| pte.kpage)
    }

    fn is_accessed(&self, upage: u64) -> bool {
        self.ptes
            .get(&upage)
            .map_or(false, |pte| pte.flags.has(PteFlags::ACCESSED))
    }

    fn set_accessed(&mut self, upage: u64, yes: bool) {
        if let Some(pte) = self.ptes.get_mut(&upage) {
            pte.flags.set(PteFlags::ACCESSED, yes);
        }
    }

    fn is_dirty(&self, upage: u64) -> bool {
        self.ptes
            .get(&upage)
            .map_or(false, |pte| pte.flags.has(PteFlags::DIRTY))
    }

    fn set_dirty(&mut self, upage: u64, yes: bool) {
        if let Some(pte) = self.ptes.get_mut(&upage) {
            pte.flags.set(PteFlags::DIRTY, yes);
        }
    }

    fn is_writable(&self, upage: u64) -> bool {
        self.ptes
            .get(&upage)
            .map_or(false, |pte| pte.flags.has(PteFlags::WRITABLE))
    }
}
