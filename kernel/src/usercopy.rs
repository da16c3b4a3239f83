//! User/Kernel Memory Copy
//!
//! Validation and copy primitives for user pointers crossing into the
//! kernel. Every byte of a range is checked against the owner's
//! supplemental page table (faulting pages in, growing the stack where the
//! saved stack pointer allows it) before the kernel touches it, and every
//! touched frame stays pinned for the duration of the kernel's access so
//! the clock hand cannot evict a buffer out from under an I/O.

use alloc::string::String;
use alloc::vec::Vec;

use crate::memory::fault;
use crate::memory::swap::SwapManager;
use crate::memory::{is_user_vaddr, page_down, page_offset, VmError, PAGE_SIZE};
use crate::process::Pid;
use crate::vm::VmState;

/// One page-sized piece of a validated user range.
pub struct Chunk {
    pub frame: usize,
    pub upage: u64,
    pub offset: usize,
    pub len: usize,
}

/// A validated user range whose frames are pinned.
pub struct PinnedRange {
    pub chunks: Vec<Chunk>,
}

impl PinnedRange {
    pub fn len(&self) -> usize {
        self.chunks.iter().map(|c| c.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Fault one page in (validating access on the way) and pin its frame.
fn ensure_pinned(
    st: &mut VmState,
    swap: &SwapManager,
    pid: Pid,
    va: u64,
    write: bool,
    esp: u64,
) -> Result<usize, VmError> {
    fault::handle(st, swap, pid, va, write, esp)?;
    let upage = page_down(va);
    let proc = st.procs.get(&pid).ok_or(VmError::BadAccess)?;
    let frame = proc.pagedir.lookup(upage).ok_or(VmError::BadAccess)?;
    st.frames.set_pinned(frame, true);
    Ok(frame)
}

/// Validate `[va, va + len)` and pin every backing frame.
///
/// Frames are pinned page by page as they are validated, so an eviction
/// triggered while faulting a later page can never steal an earlier one.
/// On failure everything already pinned is released.
pub fn pin_range(
    st: &mut VmState,
    swap: &SwapManager,
    pid: Pid,
    va: u64,
    len: usize,
    write: bool,
    esp: u64,
) -> Result<PinnedRange, VmError> {
    let mut range = PinnedRange { chunks: Vec::new() };
    if len == 0 {
        return Ok(range);
    }
    if va == 0 {
        return Err(VmError::BadAccess);
    }
    let end = va.checked_add(len as u64).ok_or(VmError::BadAccess)?;
    if !is_user_vaddr(end - 1) {
        return Err(VmError::BadAccess);
    }

    let mut cur = va;
    while cur < end {
        match ensure_pinned(st, swap, pid, cur, write, esp) {
            Ok(frame) => {
                let offset = page_offset(cur);
                let n = (PAGE_SIZE - offset).min((end - cur) as usize);
                range.chunks.push(Chunk {
                    frame,
                    upage: page_down(cur),
                    offset,
                    len: n,
                });
                cur += n as u64;
            }
            Err(e) => {
                unpin_range(st, &range);
                return Err(e);
            }
        }
    }
    Ok(range)
}

/// Release the pins of a validated range.
pub fn unpin_range(st: &mut VmState, range: &PinnedRange) {
    for chunk in &range.chunks {
        st.frames.set_pinned(chunk.frame, false);
    }
}

/// Copy `len` bytes in from user space.
pub fn copy_in(
    st: &mut VmState,
    swap: &SwapManager,
    pid: Pid,
    va: u64,
    len: usize,
    esp: u64,
) -> Result<Vec<u8>, VmError> {
    let range = pin_range(st, swap, pid, va, len, false, esp)?;
    let mut out = Vec::with_capacity(len);
    for chunk in &range.chunks {
        out.extend_from_slice(&st.frames.bytes(chunk.frame)[chunk.offset..chunk.offset + chunk.len]);
        if let Some(proc) = st.procs.get_mut(&pid) {
            proc.pagedir.set_accessed(chunk.upage, true);
        }
    }
    unpin_range(st, &range);
    Ok(out)
}

/// Read one 32-bit value from the user stack (syscall number, arguments).
pub fn copy_in_u32(
    st: &mut VmState,
    swap: &SwapManager,
    pid: Pid,
    va: u64,
    esp: u64,
) -> Result<u32, VmError> {
    let bytes = copy_in(st, swap, pid, va, 4, esp)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Copy bytes out to user space, marking the pages dirty the way a user
/// store would.
pub fn copy_out(
    st: &mut VmState,
    swap: &SwapManager,
    pid: Pid,
    va: u64,
    src: &[u8],
    esp: u64,
) -> Result<(), VmError> {
    let range = pin_range(st, swap, pid, va, src.len(), true, esp)?;
    let mut off = 0usize;
    for chunk in &range.chunks {
        st.frames.bytes_mut(chunk.frame)[chunk.offset..chunk.offset + chunk.len]
            .copy_from_slice(&src[off..off + chunk.len]);
        off += chunk.len;
        if let Some(proc) = st.procs.get_mut(&pid) {
            proc.pagedir.set_accessed(chunk.upage, true);
            proc.pagedir.set_dirty(chunk.upage, true);
        }
    }
    unpin_range(st, &range);
    Ok(())
}

/// Copy in a nul-terminated string, at most `max` bytes long.
pub fn copy_in_string(
    st: &mut VmState,
    swap: &SwapManager,
    pid: Pid,
    va: u64,
    max: usize,
    esp: u64,
) -> Result<String, VmError> {
    if va == 0 {
        return Err(VmError::BadAccess);
    }

    let mut collected: Vec<u8> = Vec::new();
    let mut cur = va;
    loop {
        if !is_user_vaddr(cur) {
            return Err(VmError::BadAccess);
        }
        let frame = ensure_pinned(st, swap, pid, cur, false, esp)?;
        let offset = page_offset(cur);

        let (take, terminated) = {
            let in_page = &st.frames.bytes(frame)[offset..];
            match in_page.iter().position(|&b| b == 0) {
                Some(i) => (i, true),
                None => (in_page.len(), false),
            }
        };
        if collected.len() + take > max {
            st.frames.set_pinned(frame, false);
            return Err(VmError::BadAccess);
        }
        {
            let in_page = &st.frames.bytes(frame)[offset..offset + take];
            collected.extend_from_slice(in_page);
        }
        let upage = page_down(cur);
        if let Some(proc) = st.procs.get_mut(&pid) {
            proc.pagedir.set_accessed(upage, true);
        }
        st.frames.set_pinned(frame, false);

        if terminated {
            break;
        }
        cur = upage + PAGE_SIZE as u64;
    }

    String::from_utf8(collected).map_err(|_| VmError::BadAccess)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::RamDisk;
    use crate::memory::frame::FrameTable;
    use crate::memory::page::PageEntry;
    use crate::memory::{PHYS_BASE, STACK_MIN};
    use crate::process::Process;
    use crate::vm::VmState;
    use alloc::boxed::Box;
    use alloc::collections::BTreeMap;

    const ESP: u64 = PHYS_BASE - 64;

    fn setup(pool: usize) -> (VmState, SwapManager) {
        let mut procs = BTreeMap::new();
        procs.insert(1, Process::new(1, 0, "gate-test"));
        (
            VmState {
                frames: FrameTable::new(pool),
                procs,
            },
            SwapManager::new(Some(Box::new(RamDisk::new(256)))),
        )
    }

    #[test]
    fn null_and_kernel_pointers_are_rejected() {
        let (mut st, swap) = setup(2);
        assert!(copy_in(&mut st, &swap, 1, 0, 4, ESP).is_err());
        assert!(copy_in(&mut st, &swap, 1, PHYS_BASE, 4, ESP).is_err());
        // A range ending past the user boundary fails even if it starts
        // inside it.
        assert!(copy_in(&mut st, &swap, 1, PHYS_BASE - 2, 4, ESP).is_err());
        assert!(copy_in_string(&mut st, &swap, 1, 0, 64, ESP).is_err());
    }

    #[test]
    fn copy_round_trip_across_page_boundary() {
        let (mut st, swap) = setup(4);
        let va = PHYS_BASE - PAGE_SIZE as u64 - 3;
        let esp = va;

        copy_out(&mut st, &swap, 1, va, b"123456", esp).unwrap();
        let back = copy_in(&mut st, &swap, 1, va, 6, esp).unwrap();
        assert_eq!(&back, b"123456");

        // Both stack pages were created and marked dirty by the store.
        let proc = st.procs.get(&1).unwrap();
        assert!(proc.pagedir.is_dirty(page_down(va)));
        assert!(proc.pagedir.is_dirty(page_down(va + 5)));
        // Nothing is left pinned.
        assert_eq!(st.frames.used(), 2);
        for idx in 0..st.frames.capacity() {
            if let Some(f) = st.frames.get(idx) {
                assert!(!f.pinned);
            }
        }
    }

    #[test]
    fn copy_out_to_readonly_page_is_rejected() {
        let (mut st, swap) = setup(2);
        let proc = st.procs.get_mut(&1).unwrap();
        let mut entry = PageEntry::anonymous(0x3000_0000, 1);
        entry.writable = false;
        proc.spt.insert(entry).unwrap();

        assert_eq!(
            copy_out(&mut st, &swap, 1, 0x3000_0000, b"x", ESP),
            Err(VmError::BadAccess)
        );
        // Reading the same page is fine.
        copy_in(&mut st, &swap, 1, 0x3000_0000, 1, ESP).unwrap();
    }

    #[test]
    fn pinned_buffer_survives_pool_pressure() {
        let (mut st, swap) = setup(1);
        let va = ESP - 8;
        let range = pin_range(&mut st, &swap, 1, va, 4, true, ESP).unwrap();
        assert_eq!(range.chunks.len(), 1);

        // The pool is exhausted by the pinned page; a second fault must
        // fail rather than evict the I/O buffer.
        let other = STACK_MIN + PAGE_SIZE as u64;
        let proc = st.procs.get_mut(&1).unwrap();
        proc.spt.insert(PageEntry::anonymous(other, 1)).unwrap();
        assert_eq!(
            fault::handle(&mut st, &swap, 1, other, true, ESP),
            Err(VmError::OutOfMemory)
        );

        unpin_range(&mut st, &range);
        fault::handle(&mut st, &swap, 1, other, true, ESP).unwrap();
    }

    #[test]
    fn string_copy_stops_at_nul_and_honours_cap() {
        let (mut st, swap) = setup(4);
        let va = ESP - 16;
        copy_out(&mut st, &swap, 1, va, b"hello\0trailing", ESP).unwrap();

        let s = copy_in_string(&mut st, &swap, 1, va, 64, ESP).unwrap();
        assert_eq!(s, "hello");

        // Cap shorter than the string: killed, not truncated.
        assert!(copy_in_string(&mut st, &swap, 1, va, 3, ESP).is_err());
    }

    #[test]
    fn string_copy_crosses_pages() {
        let (mut st, swap) = setup(4);
        // Place "ab" on one page and "cd\0" on the next.
        let va = PHYS_BASE - PAGE_SIZE as u64 - 2;
        copy_out(&mut st, &swap, 1, va, b"abcd\0", va).unwrap();
        let s = copy_in_string(&mut st, &swap, 1, va, 64, va).unwrap();
        assert_eq!(s, "abcd");
    }
}
