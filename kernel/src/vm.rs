//! VM System Handle
//!
//! The process-wide singletons bundled into one handle created at boot:
//! the frame table and process registry behind the coarse filesystem/VM
//! lock, the swap manager, the filesystem and the program loader.
//!
//! The coarse lock serialises file I/O and VM bookkeeping and records its
//! holder. Code already inside it passes the guarded state down as an
//! explicit token; the public entry points assert they are not re-entered,
//! so an accidental recursive acquire fails loudly instead of deadlocking.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use conquer_once::spin::OnceCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};
use spin::{Mutex, MutexGuard};

use crate::block::BlockDevice;
use crate::fs::Filesystem;
use crate::memory::fault;
use crate::memory::frame::FrameTable;
use crate::memory::swap::SwapManager;
use crate::memory::{is_user_vaddr, page_down, page_offset, VmError, PAGE_SIZE};
use crate::process::{self, Pid, Process, ProgramLoader, PID_KERNEL};

const NO_HOLDER: u32 = u32::MAX;

/// Everything the coarse lock protects.
pub struct VmState {
    pub frames: FrameTable,
    pub procs: BTreeMap<Pid, Process>,
}

/// The coarse filesystem/VM lock with holder bookkeeping.
pub struct VmLock {
    state: Mutex<VmState>,
    holder: AtomicU32,
}

/// Guard over the coarse lock; clears the holder record on release.
pub struct VmGuard<'a> {
    lock: &'a VmLock,
    state: MutexGuard<'a, VmState>,
}

impl VmLock {
    fn new(state: VmState) -> Self {
        VmLock {
            state: Mutex::new(state),
            holder: AtomicU32::new(NO_HOLDER),
        }
    }

    /// Take the lock on behalf of `who`.
    ///
    /// # Panics
    /// On re-entrant acquisition by the current holder; callers inside the
    /// lock pass their `&mut VmState` token down instead.
    pub fn acquire(&self, who: Pid) -> VmGuard<'_> {
        assert!(
            self.holder.load(Ordering::Relaxed) != who,
            "re-entrant VM lock acquire; pass the held state down instead"
        );
        let state = self.state.lock();
        self.holder.store(who, Ordering::Relaxed);
        VmGuard { lock: self, state }
    }

    /// Pid currently inside the lock, if any.
    pub fn holder(&self) -> Option<Pid> {
        match self.holder.load(Ordering::Relaxed) {
            NO_HOLDER => None,
            pid => Some(pid),
        }
    }
}

impl Drop for VmGuard<'_> {
    fn drop(&mut self) {
        self.lock.holder.store(NO_HOLDER, Ordering::Relaxed);
    }
}

impl Deref for VmGuard<'_> {
    type Target = VmState;
    fn deref(&self) -> &VmState {
        &self.state
    }
}

impl DerefMut for VmGuard<'_> {
    fn deref_mut(&mut self) -> &mut VmState {
        &mut self.state
    }
}

/// Boot-time configuration of the VM system.
pub struct VmConfig {
    /// Frames in the user pool
    pub user_pool_pages: usize,
    /// Swap device; absence is fatal
    pub swap_device: Option<Box<dyn BlockDevice>>,
    pub fs: Box<dyn Filesystem>,
    pub loader: Box<dyn ProgramLoader>,
}

/// The VM system singleton handle.
pub struct VmSystem {
    lock: VmLock,
    pub swap: SwapManager,
    pub fs: Box<dyn Filesystem>,
    pub loader: Box<dyn ProgramLoader>,
}

/// Registered at init so trap entry points can find the handle. Everything
/// else receives `&VmSystem` explicitly.
pub static VM: OnceCell<Arc<VmSystem>> = OnceCell::uninit();

impl VmSystem {
    /// Bring up the VM system. Swap is initialised here, at boot, so the
    /// fault path carries no first-use branch.
    pub fn init(config: VmConfig) -> Arc<VmSystem> {
        let swap = SwapManager::new(config.swap_device);
        let state = VmState {
            frames: FrameTable::new(config.user_pool_pages),
            procs: BTreeMap::new(),
        };
        crate::log!(
            "[VM] user pool {} pages ({} KB)",
            config.user_pool_pages,
            config.user_pool_pages * PAGE_SIZE / 1024
        );
        let sys = Arc::new(VmSystem {
            lock: VmLock::new(state),
            swap,
            fs: config.fs,
            loader: config.loader,
        });
        let _ = VM.try_init_once(|| sys.clone());
        sys
    }

    /// The handle registered by `init`, for trap context only.
    pub fn instance() -> Arc<VmSystem> {
        VM.get().expect("VM system not initialised").clone()
    }

    /// Acquire the coarse lock (syscall and trap entry).
    pub fn enter(&self, who: Pid) -> VmGuard<'_> {
        self.lock.acquire(who)
    }

    /// Pid currently holding the coarse lock.
    pub fn lock_holder(&self) -> Option<Pid> {
        self.lock.holder()
    }

    /// Create a process from an executable name (boot or test driver).
    pub fn exec(&self, parent: Pid, cmdline: &str) -> Result<Pid, VmError> {
        let mut st = self.enter(parent);
        process::exec(
            &mut st,
            self.fs.as_ref(),
            self.loader.as_ref(),
            parent,
            cmdline,
        )
    }

    /// Page fault trap entry for a fault taken in user code. Kills the
    /// process on failure.
    pub fn page_fault(&self, pid: Pid, va: u64, write: bool, esp: u64) -> Result<(), VmError> {
        let mut st = self.enter(pid);
        let result = fault::handle(&mut st, &self.swap, pid, va, write, esp);
        if result.is_err() {
            process::exit(&mut st, &self.swap, pid, -1);
        }
        result
    }

    /// Emulated user load: what a MOV from `va` in user mode observes,
    /// faults included. Kills the process on a bad access.
    pub fn user_read(&self, pid: Pid, va: u64, dst: &mut [u8], esp: u64) -> Result<(), VmError> {
        let mut st = self.enter(pid);
        let result = user_copy(&mut st, &self.swap, pid, va, esp, Access::Read(dst));
        if result.is_err() {
            process::exit(&mut st, &self.swap, pid, -1);
        }
        result
    }

    /// Emulated user store; sets the dirty bit like the MMU would. Kills
    /// the process on a bad access or a write to a read-only page.
    pub fn user_write(&self, pid: Pid, va: u64, src: &[u8], esp: u64) -> Result<(), VmError> {
        let mut st = self.enter(pid);
        let result = user_copy(&mut st, &self.swap, pid, va, esp, Access::Write(src));
        if result.is_err() {
            process::exit(&mut st, &self.swap, pid, -1);
        }
        result
    }

    /// Frames currently in use, across all processes.
    pub fn resident_frames(&self) -> usize {
        self.enter(PID_KERNEL).frames.used()
    }
}

enum Access<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

/// Translate one user page, faulting it in if needed.
fn resolve_user_page(
    st: &mut VmState,
    swap: &SwapManager,
    pid: Pid,
    va: u64,
    write: bool,
    esp: u64,
) -> Result<usize, VmError> {
    let upage = page_down(va);
    for _ in 0..2 {
        let proc = st.procs.get(&pid).ok_or(VmError::BadAccess)?;
        if let Some(kpage) = proc.pagedir.lookup(upage) {
            if write && !proc.pagedir.is_writable(upage) {
                // A write through a read-only PTE traps; let the resolver
                // pass its verdict (it refuses).
                fault::handle(st, swap, pid, va, true, esp)?;
                continue;
            }
            return Ok(kpage);
        }
        fault::handle(st, swap, pid, va, write, esp)?;
    }
    Err(VmError::BadAccess)
}

fn user_copy(
    st: &mut VmState,
    swap: &SwapManager,
    pid: Pid,
    va: u64,
    esp: u64,
    mut access: Access,
) -> Result<(), VmError> {
    let len = match &access {
        Access::Read(dst) => dst.len(),
        Access::Write(src) => src.len(),
    };
    let write = matches!(access, Access::Write(_));

    let mut off = 0usize;
    while off < len {
        let cur = va.checked_add(off as u64).ok_or(VmError::BadAccess)?;
        if !is_user_vaddr(cur) {
            return Err(VmError::BadAccess);
        }
        let kpage = resolve_user_page(st, swap, pid, cur, write, esp)?;
        let page_off = page_offset(cur);
        let n = (PAGE_SIZE - page_off).min(len - off);

        match &mut access {
            Access::Read(dst) => {
                let bytes = st.frames.bytes(kpage);
                dst[off..off + n].copy_from_slice(&bytes[page_off..page_off + n]);
            }
            Access::Write(src) => {
                let bytes = st.frames.bytes_mut(kpage);
                bytes[page_off..page_off + n].copy_from_slice(&src[off..off + n]);
            }
        }

        let upage = page_down(cur);
        if let Some(proc) = st.procs.get_mut(&pid) {
            proc.pagedir.set_accessed(upage, true);
            if write {
                proc.pagedir.set_dirty(upage, true);
            }
        }
        off += n;
    }
    Ok(())
}
