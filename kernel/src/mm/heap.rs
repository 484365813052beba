//! Kernel heap
//!
//! On the bare-metal target the kernel's `alloc` support (the SPT maps,
//! frame descriptors, process table) comes from a linked-list heap handed
//! its memory region at boot. On the host, tests run against the system
//! allocator and this module is dormant.

#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Hand the heap its memory region. Called once at boot, before the
/// first allocation.
///
/// # Safety
/// `start` must point at `size` bytes of otherwise-unused, mapped kernel
/// memory, and this function must be called exactly once.
#[cfg(target_os = "none")]
pub unsafe fn init(start: *mut u8, size: usize) {
    // SAFETY: the caller guarantees the region is valid, unused and
    // mapped for the lifetime of the kernel.
    unsafe {
        ALLOCATOR.lock().init(start, size);
    }
    log::info!("[HEAP] {} KiB kernel heap at {:p}", size / 1024, start);
}
