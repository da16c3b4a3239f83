//! Console I/O
//!
//! Output goes to a pluggable sink (a serial port on real boots, a capture
//! buffer under test). Input arrives from the keyboard interrupt through a
//! fixed-capacity lock-free queue and is drained one byte at a time by
//! `getc`, which is the contract `read(fd == 0)` builds on.

use alloc::boxed::Box;
use core::fmt;
use conquer_once::spin::OnceCell;
use crossbeam_queue::ArrayQueue;
use lazy_static::lazy_static;
use spin::Mutex;

/// Where console output ends up.
pub trait ConsoleSink: Send {
    fn put(&mut self, bytes: &[u8]);
}

lazy_static! {
    /// Active output sink, absent until a driver registers one
    static ref SINK: Mutex<Option<Box<dyn ConsoleSink>>> = Mutex::new(None);
}

/// Keyboard byte queue, fed from interrupt context
static KEYBOARD: OnceCell<ArrayQueue<u8>> = OnceCell::uninit();

const KEYBOARD_QUEUE_SIZE: usize = 256;

/// Install the output sink. Replaces any previous one.
pub fn set_sink(sink: Box<dyn ConsoleSink>) {
    *SINK.lock() = Some(sink);
}

/// Buffered console write; output before a sink is registered is dropped.
pub fn putbuf(bytes: &[u8]) {
    if let Some(sink) = SINK.lock().as_mut() {
        sink.put(bytes);
    }
}

struct PutbufWriter;

impl fmt::Write for PutbufWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        putbuf(s.as_bytes());
        Ok(())
    }
}

/// Formatted console write (internal use)
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    let _ = PutbufWriter.write_fmt(args);
}

fn keyboard_queue() -> &'static ArrayQueue<u8> {
    let _ = KEYBOARD.try_init_once(|| ArrayQueue::new(KEYBOARD_QUEUE_SIZE));
    KEYBOARD
        .try_get()
        .expect("keyboard queue initialisation failed")
}

/// Queue one input byte. Called by the keyboard interrupt handler.
pub fn keyboard_push(byte: u8) {
    if keyboard_queue().push(byte).is_err() {
        crate::log_warn!("[CONSOLE] keyboard queue full, dropping input");
    }
}

/// Blocking read of one console byte.
pub fn getc() -> u8 {
    let queue = keyboard_queue();
    loop {
        if let Some(byte) = queue.pop() {
            return byte;
        }
        core::hint::spin_loop();
    }
}

/// Shared capture sink for the test suite. Tests run in parallel inside one
/// process, so there is exactly one buffer and assertions match on process
/// names unique to each test.
#[cfg(test)]
pub mod capture {
    use super::*;
    use alloc::string::String;
    use alloc::vec::Vec;

    lazy_static! {
        static ref CAPTURED: Mutex<Vec<u8>> = Mutex::new(Vec::new());
    }

    struct CaptureSink;

    impl ConsoleSink for CaptureSink {
        fn put(&mut self, bytes: &[u8]) {
            CAPTURED.lock().extend_from_slice(bytes);
        }
    }

    /// Route console output into the shared capture buffer.
    pub fn install() {
        set_sink(Box::new(CaptureSink));
    }

    /// Everything captured so far.
    pub fn contents() -> String {
        String::from_utf8_lossy(&CAPTURED.lock()).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The keyboard queue is process-global and tests run in parallel, so the
    // only queue exerciser lives in the syscall read(fd == 0) test.

    #[test]
    fn capture_sees_putbuf() {
        capture::install();
        putbuf(b"console-capture-probe");
        assert!(capture::contents().contains("console-capture-probe"));
    }
}
