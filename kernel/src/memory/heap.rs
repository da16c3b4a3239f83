//! Kernel Heap Allocator
//!
//! Global allocator for kernel metadata (page tables, descriptors, file
//! tables). Under test the host libc owns the heap instead.

#[cfg(not(test))]
use linked_list_allocator::LockedHeap;

/// Global kernel heap allocator
#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Initialize the kernel heap at `heap_start`.
///
/// # Safety
/// The range must be mapped, writable and unused by anything else; may only
/// be called once.
#[cfg(not(test))]
pub unsafe fn init_at(heap_start: usize, heap_size: usize) {
    ALLOCATOR.lock().init(heap_start as *mut u8, heap_size);
}

/// Used heap space in bytes
#[cfg(not(test))]
pub fn used() -> usize {
    ALLOCATOR.lock().used()
}

/// Free heap space in bytes
#[cfg(not(test))]
pub fn free() -> usize {
    ALLOCATOR.lock().free()
}
