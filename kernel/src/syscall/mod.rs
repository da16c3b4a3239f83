//! System Call Gate
//!
//! Dispatch for the VM-relevant syscall set. The number and the arguments
//! are 32-bit values on the user stack, number at the saved `esp` and
//! arguments above it; everything is fetched through the usercopy layer,
//! so a process handing the kernel a bad stack pointer dies here and not
//! somewhere deeper. The return value lands in `eax` (the `i32` carried by
//! `SysResult::Ok`).
//!
//! The coarse filesystem/VM lock is taken once at entry; every handler
//! below runs inside it and passes the guarded state down.

use crate::console;
use crate::memory::mmap::{self, MAP_FAILED};
use crate::memory::swap::SwapManager;
use crate::memory::{is_page_aligned, VmError, PAGE_SIZE};
use crate::process::{self, Pid};
use crate::usercopy;
use crate::vm::{VmState, VmSystem};

/// Syscall numbers as pushed by the user-side stubs
pub mod nr {
    pub const HALT: u32 = 0;
    pub const EXIT: u32 = 1;
    pub const EXEC: u32 = 2;
    pub const WAIT: u32 = 3;
    pub const CREATE: u32 = 4;
    pub const REMOVE: u32 = 5;
    pub const OPEN: u32 = 6;
    pub const FILESIZE: u32 = 7;
    pub const READ: u32 = 8;
    pub const WRITE: u32 = 9;
    pub const SEEK: u32 = 10;
    pub const TELL: u32 = 11;
    pub const CLOSE: u32 = 12;
    pub const MMAP: u32 = 13;
    pub const MUNMAP: u32 = 14;
}

/// Longest string argument accepted through the gate
const MAX_STR_ARG: usize = PAGE_SIZE;

/// Outcome of one syscall as seen by the trap return path.
#[derive(Debug, PartialEq, Eq)]
pub enum SysResult {
    /// Value for `eax`
    Ok(i32),
    /// The process terminated (explicitly or killed by the gate)
    Exited(i32),
    /// Machine power-off requested
    Halt,
}

/// Internal control flow: a handler either produces `eax` or ends the
/// process (or the machine).
enum Flow {
    Exit(i32),
    Halt,
}

/// Gate failures kill the caller with -1.
impl From<VmError> for Flow {
    fn from(_: VmError) -> Flow {
        Flow::Exit(-1)
    }
}

/// Handle the syscall a process trapped into the kernel with.
pub fn handle(vm: &VmSystem, pid: Pid, esp: u64) -> SysResult {
    let mut st = vm.enter(pid);
    match dispatch(vm, &mut st, pid, esp) {
        Ok(eax) => SysResult::Ok(eax),
        Err(Flow::Exit(status)) => {
            process::exit(&mut st, &vm.swap, pid, status);
            SysResult::Exited(status)
        }
        Err(Flow::Halt) => SysResult::Halt,
    }
}

/// One 32-bit argument at `esp + 4 + 4i`.
fn arg(
    st: &mut VmState,
    swap: &SwapManager,
    pid: Pid,
    esp: u64,
    i: u64,
) -> Result<u32, VmError> {
    usercopy::copy_in_u32(st, swap, pid, esp + 4 + 4 * i, esp)
}

fn dispatch(vm: &VmSystem, st: &mut VmState, pid: Pid, esp: u64) -> Result<i32, Flow> {
    let swap = &vm.swap;
    let number = usercopy::copy_in_u32(st, swap, pid, esp, esp)?;

    match number {
        nr::HALT => Err(Flow::Halt),

        nr::EXIT => {
            let status = arg(st, swap, pid, esp, 0)? as i32;
            Err(Flow::Exit(status))
        }

        nr::EXEC => {
            let ptr = arg(st, swap, pid, esp, 0)? as u64;
            let cmdline = usercopy::copy_in_string(st, swap, pid, ptr, MAX_STR_ARG, esp)?;
            match process::exec(st, vm.fs.as_ref(), vm.loader.as_ref(), pid, &cmdline) {
                Ok(child) => Ok(child as i32),
                Err(_) => Ok(-1),
            }
        }

        nr::WAIT => {
            let child = arg(st, swap, pid, esp, 0)?;
            Ok(process::wait(st, pid, child))
        }

        nr::CREATE => {
            let ptr = arg(st, swap, pid, esp, 0)? as u64;
            let size = arg(st, swap, pid, esp, 1)?;
            let name = usercopy::copy_in_string(st, swap, pid, ptr, MAX_STR_ARG, esp)?;
            Ok(vm.fs.create(&name, size as u64) as i32)
        }

        nr::REMOVE => {
            let ptr = arg(st, swap, pid, esp, 0)? as u64;
            let name = usercopy::copy_in_string(st, swap, pid, ptr, MAX_STR_ARG, esp)?;
            Ok(vm.fs.remove(&name) as i32)
        }

        nr::OPEN => {
            let ptr = arg(st, swap, pid, esp, 0)? as u64;
            let name = usercopy::copy_in_string(st, swap, pid, ptr, MAX_STR_ARG, esp)?;
            let proc = st.procs.get_mut(&pid).ok_or(VmError::BadAccess)?;
            match vm.fs.open(&name) {
                Some(file) => Ok(proc.install_file(file)),
                None => Ok(-1),
            }
        }

        nr::FILESIZE => {
            let fd = arg(st, swap, pid, esp, 0)? as i32;
            let proc = st.procs.get(&pid).ok_or(VmError::BadAccess)?;
            Ok(proc.file(fd).map_or(0, |f| f.length() as i32))
        }

        nr::READ => {
            let fd = arg(st, swap, pid, esp, 0)? as i32;
            let buf = arg(st, swap, pid, esp, 1)? as u64;
            let n = arg(st, swap, pid, esp, 2)? as usize;
            sys_read(vm, st, pid, esp, fd, buf, n)
        }

        nr::WRITE => {
            let fd = arg(st, swap, pid, esp, 0)? as i32;
            let buf = arg(st, swap, pid, esp, 1)? as u64;
            let n = arg(st, swap, pid, esp, 2)? as usize;
            sys_write(vm, st, pid, esp, fd, buf, n)
        }

        nr::SEEK => {
            let fd = arg(st, swap, pid, esp, 0)? as i32;
            let pos = arg(st, swap, pid, esp, 1)?;
            let proc = st.procs.get_mut(&pid).ok_or(VmError::BadAccess)?;
            if let Some(file) = proc.file_mut(fd) {
                file.seek(pos as u64);
            }
            Ok(0)
        }

        nr::TELL => {
            let fd = arg(st, swap, pid, esp, 0)? as i32;
            let proc = st.procs.get(&pid).ok_or(VmError::BadAccess)?;
            Ok(proc.file(fd).map_or(-1, |f| f.tell() as i32))
        }

        nr::CLOSE => {
            let fd = arg(st, swap, pid, esp, 0)? as i32;
            let proc = st.procs.get_mut(&pid).ok_or(VmError::BadAccess)?;
            proc.close_fd(fd);
            Ok(0)
        }

        nr::MMAP => {
            let fd = arg(st, swap, pid, esp, 0)? as i32;
            let addr = arg(st, swap, pid, esp, 1)? as u64;
            sys_mmap(st, pid, fd, addr)
        }

        nr::MUNMAP => {
            let mapid = arg(st, swap, pid, esp, 0)? as i32;
            let VmState { frames, procs } = st;
            let proc = procs.get_mut(&pid).ok_or(VmError::BadAccess)?;
            // Unknown map ids are fatal.
            mmap::unmap(frames, proc, swap, mapid)?;
            Ok(0)
        }

        _ => {
            crate::log_warn!("[SYSCALL] pid={} unknown syscall {}", pid, number);
            Err(Flow::Exit(-1))
        }
    }
}

fn sys_read(
    vm: &VmSystem,
    st: &mut VmState,
    pid: Pid,
    esp: u64,
    fd: i32,
    buf: u64,
    n: usize,
) -> Result<i32, Flow> {
    let swap = &vm.swap;
    match fd {
        // Console: one byte at a time, straight into the pinned user
        // buffer, always exactly n bytes.
        0 => {
            let range = usercopy::pin_range(st, swap, pid, buf, n, true, esp)?;
            for chunk in &range.chunks {
                for i in 0..chunk.len {
                    let byte = console::getc();
                    st.frames.bytes_mut(chunk.frame)[chunk.offset + i] = byte;
                }
                if let Some(proc) = st.procs.get_mut(&pid) {
                    proc.pagedir.set_accessed(chunk.upage, true);
                    proc.pagedir.set_dirty(chunk.upage, true);
                }
            }
            usercopy::unpin_range(st, &range);
            Ok(n as i32)
        }
        1 => Ok(-1),
        _ => {
            if st.procs.get(&pid).and_then(|p| p.file(fd)).is_none() {
                return Ok(-1);
            }
            // The buffer stays pinned while the filesystem fills it.
            let range = usercopy::pin_range(st, swap, pid, buf, n, true, esp)?;
            let mut total = 0usize;
            {
                let VmState { frames, procs } = &mut *st;
                let proc = procs.get_mut(&pid).ok_or(VmError::BadAccess)?;
                if let Some(file) = proc.files.get_mut(&fd) {
                    for chunk in &range.chunks {
                        let bytes = frames.bytes_mut(chunk.frame);
                        let got =
                            file.read(&mut bytes[chunk.offset..chunk.offset + chunk.len]);
                        proc.pagedir.set_accessed(chunk.upage, true);
                        proc.pagedir.set_dirty(chunk.upage, true);
                        total += got;
                        if got < chunk.len {
                            break;
                        }
                    }
                }
            }
            usercopy::unpin_range(st, &range);
            Ok(total as i32)
        }
    }
}

fn sys_write(
    vm: &VmSystem,
    st: &mut VmState,
    pid: Pid,
    esp: u64,
    fd: i32,
    buf: u64,
    n: usize,
) -> Result<i32, Flow> {
    let swap = &vm.swap;
    match fd {
        0 => Ok(-1),
        // Console: buffered put of the whole (pinned) buffer.
        1 => {
            let range = usercopy::pin_range(st, swap, pid, buf, n, false, esp)?;
            for chunk in &range.chunks {
                console::putbuf(&st.frames.bytes(chunk.frame)[chunk.offset..chunk.offset + chunk.len]);
                if let Some(proc) = st.procs.get_mut(&pid) {
                    proc.pagedir.set_accessed(chunk.upage, true);
                }
            }
            usercopy::unpin_range(st, &range);
            Ok(n as i32)
        }
        _ => {
            if st.procs.get(&pid).and_then(|p| p.file(fd)).is_none() {
                return Ok(-1);
            }
            let range = usercopy::pin_range(st, swap, pid, buf, n, false, esp)?;
            let mut total = 0usize;
            {
                let VmState { frames, procs } = &mut *st;
                let proc = procs.get_mut(&pid).ok_or(VmError::BadAccess)?;
                if let Some(file) = proc.files.get_mut(&fd) {
                    for chunk in &range.chunks {
                        let bytes = frames.bytes(chunk.frame);
                        let put = file.write(&bytes[chunk.offset..chunk.offset + chunk.len]);
                        proc.pagedir.set_accessed(chunk.upage, true);
                        total += put;
                        if put < chunk.len {
                            break;
                        }
                    }
                }
            }
            usercopy::unpin_range(st, &range);
            Ok(total as i32)
        }
    }
}

fn sys_mmap(st: &mut VmState, pid: Pid, fd: i32, addr: u64) -> Result<i32, Flow> {
    if fd < 2 {
        return Ok(MAP_FAILED);
    }
    // Obviously bad addresses fail before the handle is even re-opened.
    if addr == 0 || !is_page_aligned(addr) {
        return Ok(MAP_FAILED);
    }
    let proc = st.procs.get_mut(&pid).ok_or(VmError::BadAccess)?;
    let handle = match proc.file(fd) {
        Some(file) => file.reopen(),
        None => return Ok(MAP_FAILED),
    };
    match mmap::map_file(proc, handle, addr) {
        Ok(mapid) => Ok(mapid),
        Err(_) => Ok(MAP_FAILED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::RamDisk;
    use crate::console::capture;
    use crate::fs::{Filesystem, RamFs};
    use crate::memory::{PHYS_BASE, STACK_MIN};
    use crate::process::{FlatLoader, PID_KERNEL, USER_BASE};
    use crate::vm::VmConfig;
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    const ESP: u64 = PHYS_BASE - 256;
    const MAP_AT: u64 = 0x1000_0000;

    fn boot_with(pool: usize, fs: RamFs) -> Arc<VmSystem> {
        capture::install();
        VmSystem::init(VmConfig {
            user_pool_pages: pool,
            swap_device: Some(Box::new(RamDisk::new(2048))),
            fs: Box::new(fs),
            loader: Box::new(FlatLoader),
        })
    }

    fn spawn(vm: &VmSystem, name: &str) -> Pid {
        vm.exec(PID_KERNEL, name).unwrap()
    }

    /// Write a syscall frame (number + args) to the user stack and
    /// dispatch it, exactly as the trap path would.
    fn call(vm: &VmSystem, pid: Pid, number: u32, args: &[u32]) -> SysResult {
        let mut frame = Vec::new();
        frame.extend_from_slice(&number.to_le_bytes());
        for a in args {
            frame.extend_from_slice(&a.to_le_bytes());
        }
        vm.user_write(pid, ESP, &frame, ESP).unwrap();
        handle(vm, pid, ESP)
    }

    /// Place a nul-terminated string in user memory, returning its address.
    fn user_str(vm: &VmSystem, pid: Pid, at: u64, s: &str) -> u32 {
        let mut bytes = Vec::from(s.as_bytes());
        bytes.push(0);
        vm.user_write(pid, at, &bytes, at).unwrap();
        at as u32
    }

    fn expect_eax(result: SysResult) -> i32 {
        match result {
            SysResult::Ok(eax) => eax,
            other => panic!("syscall did not return normally: {:?}", other),
        }
    }

    #[test]
    fn bad_stack_pointer_kills() {
        let fs = RamFs::new();
        fs.put("bad-esp", &[0x90u8; 16]);
        let vm = boot_with(4, fs);
        let pid = spawn(&vm, "bad-esp");

        assert_eq!(handle(&vm, pid, PHYS_BASE + 4), SysResult::Exited(-1));
        assert!(capture::contents().contains("bad-esp: exit(-1)"));
    }

    #[test]
    fn exit_prints_line_and_releases_everything() {
        let fs = RamFs::new();
        fs.put("clean-exit", &[0x90u8; 16]);
        let vm = boot_with(4, fs);
        let pid = spawn(&vm, "clean-exit");

        assert_eq!(call(&vm, pid, nr::EXIT, &[3]), SysResult::Exited(3));
        assert!(capture::contents().contains("clean-exit: exit(3)"));
        assert_eq!(vm.resident_frames(), 0);
    }

    #[test]
    fn halt_powers_off() {
        let fs = RamFs::new();
        fs.put("halter", &[0x90u8; 16]);
        let vm = boot_with(4, fs);
        let pid = spawn(&vm, "halter");
        assert_eq!(call(&vm, pid, nr::HALT, &[]), SysResult::Halt);
    }

    #[test]
    fn file_crud_through_the_gate() {
        let fs = RamFs::new();
        fs.put("crud", &[0x90u8; 16]);
        let vm = boot_with(4, fs);
        let pid = spawn(&vm, "crud");

        let name = user_str(&vm, pid, ESP - 64, "notes.txt");
        assert_eq!(expect_eax(call(&vm, pid, nr::CREATE, &[name, 100])), 1);
        assert_eq!(expect_eax(call(&vm, pid, nr::CREATE, &[name, 100])), 0);

        let fd = expect_eax(call(&vm, pid, nr::OPEN, &[name]));
        assert_eq!(fd, 2, "first fd after the console pair");
        assert_eq!(expect_eax(call(&vm, pid, nr::FILESIZE, &[fd as u32])), 100);

        // Write through the gate, then read it back after a seek.
        let buf = user_str(&vm, pid, ESP - 128, "payload");
        assert_eq!(expect_eax(call(&vm, pid, nr::WRITE, &[fd as u32, buf, 7])), 7);
        assert_eq!(expect_eax(call(&vm, pid, nr::TELL, &[fd as u32])), 7);
        assert_eq!(expect_eax(call(&vm, pid, nr::SEEK, &[fd as u32, 0])), 0);

        let readback = ESP - 196;
        assert_eq!(
            expect_eax(call(&vm, pid, nr::READ, &[fd as u32, readback as u32, 7])),
            7
        );
        let mut got = [0u8; 7];
        vm.user_read(pid, readback, &mut got, ESP).unwrap();
        assert_eq!(&got, b"payload");

        assert_eq!(expect_eax(call(&vm, pid, nr::CLOSE, &[fd as u32])), 0);
        assert_eq!(expect_eax(call(&vm, pid, nr::REMOVE, &[name])), 1);
        assert_eq!(expect_eax(call(&vm, pid, nr::OPEN, &[name])), -1);
    }

    #[test]
    fn console_read_and_write() {
        let fs = RamFs::new();
        fs.put("con-io", &[0x90u8; 16]);
        let vm = boot_with(4, fs);
        let pid = spawn(&vm, "con-io");

        for &b in b"typed" {
            console::keyboard_push(b);
        }
        let buf = ESP - 64;
        assert_eq!(expect_eax(call(&vm, pid, nr::READ, &[0, buf as u32, 5])), 5);
        let mut got = [0u8; 5];
        vm.user_read(pid, buf, &mut got, ESP).unwrap();
        assert_eq!(&got, b"typed");

        // Echo it back out through fd 1.
        assert_eq!(expect_eax(call(&vm, pid, nr::WRITE, &[1, buf as u32, 5])), 5);
        assert!(capture::contents().contains("typed"));

        // Wrong directions are benign errors.
        assert_eq!(expect_eax(call(&vm, pid, nr::READ, &[1, buf as u32, 1])), -1);
        assert_eq!(expect_eax(call(&vm, pid, nr::WRITE, &[0, buf as u32, 1])), -1);
    }

    #[test]
    fn exec_and_wait_round_trip() {
        let fs = RamFs::new();
        fs.put("parent-prog", &[0x90u8; 16]);
        fs.put("child-prog", &[0x90u8; 16]);
        let vm = boot_with(4, fs);
        let pid = spawn(&vm, "parent-prog");

        let name = user_str(&vm, pid, ESP - 64, "child-prog");
        let child = expect_eax(call(&vm, pid, nr::EXEC, &[name]));
        assert!(child > 0);

        // Child still running: wait reports -1 without blocking.
        assert_eq!(expect_eax(call(&vm, pid, nr::WAIT, &[child as u32])), -1);

        // Child exits with 9; parent reaps exactly once.
        assert_eq!(
            call(&vm, child as Pid, nr::EXIT, &[9]),
            SysResult::Exited(9)
        );
        assert_eq!(expect_eax(call(&vm, pid, nr::WAIT, &[child as u32])), 9);
        assert_eq!(expect_eax(call(&vm, pid, nr::WAIT, &[child as u32])), -1);

        let missing = user_str(&vm, pid, ESP - 64, "no-such-image");
        assert_eq!(expect_eax(call(&vm, pid, nr::EXEC, &[missing])), -1);
    }

    /// Scenario: map a 3-page file, write through the mapping, read an
    /// untouched page, unmap, and confirm the write-back through the
    /// filesystem while untouched bytes survived.
    #[test]
    fn mmap_write_back_round_trip() {
        let fs = RamFs::new();
        fs.put("mmap-prog", &[0x90u8; 16]);
        let mut contents = Vec::new();
        for i in 0..3 * PAGE_SIZE {
            contents.push((i % 251) as u8);
        }
        fs.put("data", &contents);
        let vm = boot_with(8, fs);
        let pid = spawn(&vm, "mmap-prog");

        let name = user_str(&vm, pid, ESP - 64, "data");
        let fd = expect_eax(call(&vm, pid, nr::OPEN, &[name]));
        let mapid = expect_eax(call(&vm, pid, nr::MMAP, &[fd as u32, MAP_AT as u32]));
        assert_eq!(mapid, 0);

        // Closing the fd must not break the mapping (it was re-opened).
        assert_eq!(expect_eax(call(&vm, pid, nr::CLOSE, &[fd as u32])), 0);

        // Store into byte 0 through the mapping.
        vm.user_write(pid, MAP_AT, b"X", ESP).unwrap();

        // Byte 2*PAGE_SIZE + 5 must be the original file byte.
        let probe = 2 * PAGE_SIZE + 5;
        let mut got = [0u8; 1];
        vm.user_read(pid, MAP_AT + probe as u64, &mut got, ESP).unwrap();
        assert_eq!(got[0], (probe % 251) as u8);

        assert_eq!(expect_eax(call(&vm, pid, nr::MUNMAP, &[mapid as u32])), 0);

        // Reopen and check through the filesystem: the write stuck, the
        // untouched byte did not change.
        let fd = expect_eax(call(&vm, pid, nr::OPEN, &[name]));
        let buf = ESP - 128;
        assert_eq!(expect_eax(call(&vm, pid, nr::READ, &[fd as u32, buf as u32, 1])), 1);
        vm.user_read(pid, buf, &mut got, ESP).unwrap();
        assert_eq!(got[0], b'X');

        assert_eq!(expect_eax(call(&vm, pid, nr::SEEK, &[fd as u32, probe as u32])), 0);
        assert_eq!(expect_eax(call(&vm, pid, nr::READ, &[fd as u32, buf as u32, 1])), 1);
        vm.user_read(pid, buf, &mut got, ESP).unwrap();
        assert_eq!(got[0], (probe % 251) as u8);

        // Unmapping the same id again is fatal.
        assert_eq!(
            call(&vm, pid, nr::MUNMAP, &[mapid as u32]),
            SysResult::Exited(-1)
        );
        assert!(capture::contents().contains("mmap-prog: exit(-1)"));
    }

    /// Scenario: stack growth under pool pressure, with a dirty mapping
    /// that must still write back correctly afterwards.
    #[test]
    fn stack_growth_survives_eviction_and_mmap_still_writes_back() {
        let fs = RamFs::new();
        fs.put("stack-prog", &[0x90u8; 16]);
        fs.put("stack-data", &[0u8; PAGE_SIZE]);
        let vm = boot_with(4, fs);
        let pid = spawn(&vm, "stack-prog");

        let name = user_str(&vm, pid, ESP - 64, "stack-data");
        let fd = expect_eax(call(&vm, pid, nr::OPEN, &[name]));
        let mapid = expect_eax(call(&vm, pid, nr::MMAP, &[fd as u32, MAP_AT as u32]));
        vm.user_write(pid, MAP_AT, b"persist", ESP).unwrap();

        // Grow the stack page by page well past the pool size; each write
        // lands within the push window of its own esp.
        for i in 1..=8u64 {
            let esp = PHYS_BASE - i * PAGE_SIZE as u64;
            vm.user_write(pid, esp - 4, &(i as u32).to_le_bytes(), esp)
                .unwrap();
        }

        // Every grown page still holds its value (some came back from
        // swap).
        for i in 1..=8u64 {
            let va = PHYS_BASE - i * PAGE_SIZE as u64 - 4;
            let mut got = [0u8; 4];
            vm.user_read(pid, va, &mut got, va).unwrap();
            assert_eq!(u32::from_le_bytes(got), i as u32);
        }

        // The mapping was likely evicted in the meantime; munmap must
        // still produce the write-back.
        assert_eq!(expect_eax(call(&vm, pid, nr::MUNMAP, &[mapid as u32])), 0);
        let check = vm.fs.open("stack-data").unwrap();
        let mut buf = [0u8; 7];
        check.read_at(&mut buf, 0);
        assert_eq!(&buf, b"persist");
    }

    /// Scenario: two processes each touching more than half the pool, both
    /// completing, pool empty at quiescence.
    #[test]
    fn two_processes_share_the_pool() {
        let fs = RamFs::new();
        fs.put("pool-a", &[0x90u8; 16]);
        fs.put("pool-b", &[0x90u8; 16]);
        let vm = boot_with(8, fs);
        let a = spawn(&vm, "pool-a");
        let b = spawn(&vm, "pool-b");

        // Interleave: each process dirties 6 stack pages (>50% of the
        // pool each), with per-process patterns.
        for i in 1..=6u64 {
            for &(pid, tag) in &[(a, 0xA0u8), (b, 0xB0u8)] {
                let esp = PHYS_BASE - i * PAGE_SIZE as u64;
                let marker = [tag ^ i as u8; 16];
                vm.user_write(pid, esp - 16, &marker, esp).unwrap();
            }
        }

        // Both processes observe their own values.
        for i in 1..=6u64 {
            for &(pid, tag) in &[(a, 0xA0u8), (b, 0xB0u8)] {
                let va = PHYS_BASE - i * PAGE_SIZE as u64 - 16;
                let mut got = [0u8; 16];
                vm.user_read(pid, va, &mut got, va).unwrap();
                assert!(got.iter().all(|&x| x == tag ^ i as u8));
            }
        }

        assert_eq!(call(&vm, a, nr::EXIT, &[0]), SysResult::Exited(0));
        assert_eq!(call(&vm, b, nr::EXIT, &[0]), SysResult::Exited(0));
        assert!(capture::contents().contains("pool-a: exit(0)"));
        assert!(capture::contents().contains("pool-b: exit(0)"));
        assert_eq!(vm.resident_frames(), 0);
        assert_eq!(vm.swap.used_slots(), 0);
    }

    /// Scenario: a mapping that would reach into the stack reservation is
    /// refused with no side effects.
    #[test]
    fn mmap_into_stack_region_fails_without_side_effects() {
        let fs = RamFs::new();
        fs.put("stack-overlap", &[0x90u8; 16]);
        fs.put("data3", &[1u8; 3 * PAGE_SIZE]);
        let vm = boot_with(4, fs);
        let pid = spawn(&vm, "stack-overlap");

        let name = user_str(&vm, pid, ESP - 64, "data3");
        let fd = expect_eax(call(&vm, pid, nr::OPEN, &[name]));

        let spt_before = {
            let st = vm.enter(PID_KERNEL);
            st.procs.get(&pid).unwrap().spt.len()
        };

        // addr + length crosses into [STACK_MIN, PHYS_BASE): refused.
        let at = (STACK_MIN - PAGE_SIZE as u64) as u32;
        assert_eq!(expect_eax(call(&vm, pid, nr::MMAP, &[fd as u32, at])), -1);

        // Overlap with an existing mapping: also refused, also clean.
        assert_eq!(
            expect_eax(call(&vm, pid, nr::MMAP, &[fd as u32, MAP_AT as u32])),
            0
        );
        assert_eq!(
            expect_eax(call(
                &vm,
                pid,
                nr::MMAP,
                &[fd as u32, (MAP_AT + PAGE_SIZE as u64) as u32]
            )),
            -1
        );

        let st = vm.enter(PID_KERNEL);
        let proc = st.procs.get(&pid).unwrap();
        assert_eq!(proc.spt.len(), spt_before + 3, "failed mmaps left entries");
        assert_eq!(proc.mmaps.len(), 1);
    }

    /// Scenario: unaligned mmap address fails before any entry is made.
    #[test]
    fn mmap_unaligned_address_fails() {
        let fs = RamFs::new();
        fs.put("unaligned", &[0x90u8; 16]);
        fs.put("f", &[1u8; 64]);
        let vm = boot_with(4, fs);
        let pid = spawn(&vm, "unaligned");

        let name = user_str(&vm, pid, ESP - 64, "f");
        let fd = expect_eax(call(&vm, pid, nr::OPEN, &[name]));

        let spt_before = {
            let st = vm.enter(PID_KERNEL);
            st.procs.get(&pid).unwrap().spt.len()
        };
        assert_eq!(expect_eax(call(&vm, pid, nr::MMAP, &[fd as u32, 0x4])), -1);
        assert_eq!(expect_eax(call(&vm, pid, nr::MMAP, &[fd as u32, 0])), -1);
        assert_eq!(expect_eax(call(&vm, pid, nr::MMAP, &[1, MAP_AT as u32])), -1);

        let st = vm.enter(PID_KERNEL);
        let proc = st.procs.get(&pid).unwrap();
        assert_eq!(proc.spt.len(), spt_before);
        assert!(proc.mmaps.is_empty());
        assert_eq!(proc.next_mapid, 0);
    }

    /// Scenario: storing into a read-only executable page kills the
    /// process with the exact exit line.
    #[test]
    fn write_to_readonly_code_page_kills() {
        let fs = RamFs::new();
        fs.put("scen-six", &[0x90u8; PAGE_SIZE]);
        let vm = boot_with(4, fs);
        let pid = spawn(&vm, "scen-six");

        assert!(vm.user_write(pid, USER_BASE, b"#", ESP).is_err());
        assert!(capture::contents().contains("scen-six: exit(-1)"));

        let st = vm.enter(PID_KERNEL);
        assert!(!st.procs.get(&pid).unwrap().alive());
    }

    /// mmap of a zero-length file fails.
    #[test]
    fn mmap_zero_length_file_fails() {
        let fs = RamFs::new();
        fs.put("zlf", &[0x90u8; 16]);
        fs.create("empty-file", 0);
        let vm = boot_with(4, fs);
        let pid = spawn(&vm, "zlf");

        let name = user_str(&vm, pid, ESP - 64, "empty-file");
        let fd = expect_eax(call(&vm, pid, nr::OPEN, &[name]));
        assert_eq!(
            expect_eax(call(&vm, pid, nr::MMAP, &[fd as u32, MAP_AT as u32])),
            -1
        );
    }
}
