//! Process Manager
//!
//! Per-process VM state: supplemental page table, mapping table, open file
//! table and the MMU page directory handle. Scheduling and context switch
//! live outside this crate; a process here is the resource container the
//! VM layer charges its pages to.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::fs::{File, Filesystem};
use crate::memory::mmap::{self, MapId, MmapTable};
use crate::memory::page::SuppPageTable;
use crate::memory::paging::{PageDir, SoftPageDir};
use crate::memory::swap::SwapManager;
use crate::memory::{VmError, PAGE_SIZE};
use crate::vm::VmState;

/// Process ID type
pub type Pid = u32;

/// Pid of the kernel itself, never a real process
pub const PID_KERNEL: Pid = 0;

static NEXT_PID: AtomicU32 = AtomicU32::new(1);

/// Load address of a program image
pub const USER_BASE: u64 = 0x0804_8000;

/// The ELF loader seam: given a fresh process and its opened image,
/// register the lazy page descriptors for its segments.
pub trait ProgramLoader: Send + Sync {
    fn load(&self, proc: &mut Process, image: File) -> Result<(), VmError>;
}

/// Reference loader: the whole image becomes read-only executable pages at
/// `USER_BASE`, one lazy descriptor per file page. Real ELF parsing is a
/// collaborator concern.
pub struct FlatLoader;

impl ProgramLoader for FlatLoader {
    fn load(&self, proc: &mut Process, image: File) -> Result<(), VmError> {
        let len = image.length();
        if len == 0 {
            return Err(VmError::Io);
        }
        let pages = (len as usize + PAGE_SIZE - 1) / PAGE_SIZE;
        for i in 0..pages {
            let offset = (i * PAGE_SIZE) as u64;
            let read_bytes = PAGE_SIZE.min((len - offset) as usize);
            proc.spt.create_file_backed(
                USER_BASE + offset,
                proc.pid,
                image.reopen(),
                false,
                offset,
                read_bytes,
                PAGE_SIZE - read_bytes,
                true,
            )?;
        }
        Ok(())
    }
}

/// Process control block, VM-relevant subset.
pub struct Process {
    pub pid: Pid,
    pub parent: Pid,
    pub name: String,
    /// MMU mapping oracle for this address space
    pub pagedir: Box<dyn PageDir>,
    pub spt: SuppPageTable,
    pub mmaps: MmapTable,
    /// Open files; fds 0 and 1 are the console and never appear here
    pub files: BTreeMap<i32, File>,
    pub next_fd: i32,
    pub next_mapid: MapId,
    /// Set once the process has exited; resources are gone, the zombie
    /// remains until the parent waits
    pub exit_status: Option<i32>,
}

impl Process {
    pub fn new(pid: Pid, parent: Pid, name: &str) -> Self {
        Process {
            pid,
            parent,
            name: String::from(name),
            pagedir: Box::new(SoftPageDir::new()),
            spt: SuppPageTable::new(),
            mmaps: MmapTable::new(),
            files: BTreeMap::new(),
            next_fd: 2,
            next_mapid: 0,
            exit_status: None,
        }
    }

    pub fn alive(&self) -> bool {
        self.exit_status.is_none()
    }

    /// Give `file` the next free descriptor.
    pub fn install_file(&mut self, file: File) -> i32 {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.files.insert(fd, file);
        fd
    }

    pub fn file(&self, fd: i32) -> Option<&File> {
        self.files.get(&fd)
    }

    pub fn file_mut(&mut self, fd: i32) -> Option<&mut File> {
        self.files.get_mut(&fd)
    }

    pub fn close_fd(&mut self, fd: i32) -> bool {
        self.files.remove(&fd).is_some()
    }
}

/// Create a process from an executable name.
///
/// The first whitespace-separated token of `cmdline` names the image; the
/// loader registers its page descriptors lazily, so no frame is consumed
/// until the program runs.
pub fn exec(
    state: &mut VmState,
    fs: &dyn Filesystem,
    loader: &dyn ProgramLoader,
    parent: Pid,
    cmdline: &str,
) -> Result<Pid, VmError> {
    let name = cmdline.split_whitespace().next().ok_or(VmError::BadAccess)?;
    let image = fs.open(name).ok_or(VmError::Io)?;

    let pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);
    let mut proc = Process::new(pid, parent, name);
    loader.load(&mut proc, image)?;

    crate::log!("[PROC] exec '{}' as pid={}", name, pid);
    state.procs.insert(pid, proc);
    Ok(pid)
}

/// Terminate a process and release every VM resource it holds.
///
/// Live mappings are written back and unmapped, the supplemental page table
/// is destroyed (freeing frames and swap slots), open files close, and the
/// exit line is printed. The zombie stays registered for `wait`.
pub fn exit(state: &mut VmState, swap: &SwapManager, pid: Pid, status: i32) {
    let VmState { frames, procs } = state;
    let Some(proc) = procs.get_mut(&pid) else {
        return;
    };
    if !proc.alive() {
        return;
    }

    for mapid in proc.mmaps.ids() {
        let _ = mmap::unmap(frames, proc, swap, mapid);
    }

    for upage in proc.spt.pages() {
        let resident = proc.spt.lookup(upage).and_then(|entry| entry.frame);
        if let Some(idx) = resident {
            frames.free(idx);
            proc.pagedir.clear(upage);
        }
        proc.spt.remove(upage, swap);
    }

    proc.files.clear();
    proc.exit_status = Some(status);

    crate::console::_print(format_args!("{}: exit({})\n", proc.name, status));
    crate::log!("[PROC] pid={} exited with {}", pid, status);
}

/// Reap a zombie child, returning its status.
///
/// Returns -1 for an unknown pid, a non-child, an already-reaped child, or
/// a child that has not exited (blocking on a live child needs the
/// scheduler, which lives outside this crate).
pub fn wait(state: &mut VmState, parent: Pid, child: Pid) -> i32 {
    let status = match state.procs.get(&child) {
        Some(proc) if proc.parent == parent => proc.exit_status,
        _ => None,
    };
    match status {
        Some(status) => {
            state.procs.remove(&child);
            status
        }
        None => -1,
    }
}
