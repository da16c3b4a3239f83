//! Page Fault Resolver
//!
//! Classifies a fault against the owner's supplemental page table and
//! materializes the page: from the backing file, from a swap slot, by zero
//! fill, or by growing the stack. Runs under the coarse VM lock; a failure
//! here is fatal to the faulting process.

use crate::fs::File;
use crate::memory::page::{PageBacking, PageEntry};
use crate::memory::swap::{SwapManager, SwapSlot};
use crate::memory::{
    frame, is_user_vaddr, page_down, VmError, PHYS_BASE, STACK_MIN, STACK_PUSH_SLACK,
};
use crate::process::Pid;
use crate::vm::VmState;

/// Where a missing page's contents come from.
enum Source {
    File {
        file: File,
        offset: u64,
        read_bytes: usize,
    },
    Swap(SwapSlot),
    Zero,
}

/// Resolve a fault at `va` for `pid`.
///
/// `esp` is the faulting thread's user stack pointer, saved at syscall
/// entry when the fault originates in the kernel on behalf of a user
/// buffer. Any error terminates the process (the caller's job).
pub fn handle(
    state: &mut VmState,
    swap: &SwapManager,
    pid: Pid,
    va: u64,
    write: bool,
    esp: u64,
) -> Result<(), VmError> {
    if !is_user_vaddr(va) {
        return Err(VmError::BadAccess);
    }
    let upage = page_down(va);

    enum Action {
        Present,
        Load,
        Grow,
    }

    let action = {
        let proc = state.procs.get(&pid).ok_or(VmError::BadAccess)?;
        match proc.spt.lookup(upage) {
            Some(entry) => {
                if write && !entry.writable {
                    return Err(VmError::BadAccess);
                }
                if entry.is_resident() {
                    Action::Present
                } else {
                    Action::Load
                }
            }
            None => Action::Grow,
        }
    };

    match action {
        // Spurious: another path brought the page in already.
        Action::Present => Ok(()),
        Action::Load => load_page(state, swap, pid, upage),
        Action::Grow => grow_stack(state, swap, pid, va, esp),
    }
}

/// Bring a non-resident page with an existing entry into a frame.
fn load_page(state: &mut VmState, swap: &SwapManager, pid: Pid, upage: u64) -> Result<(), VmError> {
    let (writable, source) = {
        let proc = state.procs.get(&pid).ok_or(VmError::BadAccess)?;
        let entry = proc.spt.lookup(upage).ok_or(VmError::BadAccess)?;
        let source = match &entry.backing {
            PageBacking::Executable(fb) | PageBacking::FileMapped(fb) => Source::File {
                file: fb.file.clone(),
                offset: fb.offset,
                read_bytes: fb.read_bytes,
            },
            PageBacking::Anonymous { slot: Some(slot) } => Source::Swap(*slot),
            PageBacking::Anonymous { slot: None } => Source::Zero,
        };
        (entry.writable, source)
    };

    // Pinned until mapped and populated.
    let idx = frame::acquire(state, swap, pid, upage)?;

    let filled = {
        let bytes = state.frames.bytes_mut(idx);
        match &source {
            Source::File {
                file,
                offset,
                read_bytes,
            } => {
                // Fresh frames are zeroed, so only the file region needs
                // reading; the zero tail is already in place.
                file.read_at(&mut bytes[..*read_bytes], *offset) == *read_bytes
            }
            Source::Swap(slot) => {
                swap.read_page(*slot, bytes);
                true
            }
            Source::Zero => true,
        }
    };
    if !filled {
        state.frames.free(idx);
        return Err(VmError::Io);
    }

    let proc = state
        .procs
        .get_mut(&pid)
        .expect("faulting process vanished");
    if !proc.pagedir.install(upage, idx, writable) {
        state.frames.free(idx);
        return Err(VmError::Duplicate);
    }
    let entry = proc
        .spt
        .lookup_mut(upage)
        .expect("page entry vanished during fault");
    entry.frame = Some(idx);
    // The slot is released only after the page is mapped again.
    if let PageBacking::Anonymous { slot } = &mut entry.backing {
        if let Some(slot) = slot.take() {
            swap.free(slot);
        }
    }
    state.frames.set_pinned(idx, false);
    Ok(())
}

/// Extend the stack with a zero-filled page if `va` plausibly belongs to it.
///
/// Accepts accesses at or above `esp - 32` (PUSH faults 4 bytes below the
/// stack pointer, PUSHA 32) within the reserved stack region.
fn grow_stack(
    state: &mut VmState,
    swap: &SwapManager,
    pid: Pid,
    va: u64,
    esp: u64,
) -> Result<(), VmError> {
    if va < STACK_MIN || va >= PHYS_BASE {
        return Err(VmError::BadAccess);
    }
    if va.saturating_add(STACK_PUSH_SLACK) < esp {
        return Err(VmError::BadAccess);
    }

    let upage = page_down(va);
    {
        let proc = state.procs.get_mut(&pid).ok_or(VmError::BadAccess)?;
        proc.spt.insert(PageEntry::anonymous(upage, pid))?;
    }
    crate::log_debug!("[FAULT] stack grows to {:#x} for pid={}", upage, pid);
    load_page(state, swap, pid, upage)
}
