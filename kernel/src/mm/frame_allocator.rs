//! Physical user-frame pool
//!
//! The boot code hands this allocator the contiguous region of physical
//! memory reserved for user pages (mapped at a fixed kernel virtual
//! offset), and the frame table draws single frames from it on demand.
//! A simple bitmap is all the tracking needed: allocations are always one
//! page, and exhaustion is not an error here -- the frame table responds to
//! it by evicting.

use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;

use super::{VirtualAddress, PAGE_SIZE};
use crate::sync::Subsystem;

/// Physical frame number: index of a frame within the user pool.
///
/// Frame numbers are the currency of the page-table entries and the frame
/// table; cross-references between page and frame descriptors are stored
/// as numbers, never as pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameNumber(usize);

impl FrameNumber {
    pub const fn new(num: usize) -> Self {
        Self(num)
    }

    pub const fn as_usize(&self) -> usize {
        self.0
    }
}

bitflags! {
    /// Frame allocation options
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u8 {
        /// Zero the frame before returning it
        const ZEROED = 1 << 0;
    }
}

/// Usage statistics for the user pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total_frames: usize,
    pub used_frames: usize,
}

/// Bitmap allocator over the user-frame arena
pub struct UserPool {
    /// Kernel virtual address of the first frame
    base: usize,
    /// Number of frames in the pool
    page_count: usize,
    /// One bit per frame, set = allocated
    bitmap: Vec<u64>,
    /// Allocated frame count
    used: usize,
}

impl UserPool {
    /// Create a pool over `page_count` frames starting at `base`.
    ///
    /// `base` must be page-aligned and the region `page_count * PAGE_SIZE`
    /// bytes long must be exclusively owned by the pool.
    pub fn new(base: *mut u8, page_count: usize) -> Self {
        let base = base as usize;
        assert!(base % PAGE_SIZE == 0, "user pool base is not page aligned");
        assert!(page_count > 0, "user pool is empty");
        Self {
            base,
            page_count,
            bitmap: vec![0u64; page_count.div_ceil(64)],
            used: 0,
        }
    }

    /// Allocate a single frame, returning its kernel virtual address.
    ///
    /// Returns `None` when the pool is exhausted; the caller decides
    /// whether that means eviction (frame table) or failure.
    pub fn alloc_page(&mut self, flags: AllocFlags) -> Option<VirtualAddress> {
        let (word_idx, bit) = self
            .bitmap
            .iter()
            .enumerate()
            .find_map(|(i, word)| {
                let free = !word;
                if free == 0 {
                    None
                } else {
                    Some((i, free.trailing_zeros() as usize))
                }
            })
            .filter(|&(i, bit)| i * 64 + bit < self.page_count)?;

        self.bitmap[word_idx] |= 1 << bit;
        self.used += 1;

        let kpage = VirtualAddress::new(self.base + (word_idx * 64 + bit) * PAGE_SIZE);
        if flags.contains(AllocFlags::ZEROED) {
            // SAFETY: kpage points at a full frame inside the pool arena,
            // which the pool exclusively owns, and the frame was just
            // marked allocated so nobody else references it yet.
            unsafe {
                core::ptr::write_bytes(kpage.as_mut_ptr(), 0, PAGE_SIZE);
            }
        }
        Some(kpage)
    }

    /// Return a frame to the pool.
    ///
    /// # Panics
    /// Panics if `kpage` is not an allocated frame of this pool: a double
    /// free or stray address here is a kernel bug.
    pub fn free_page(&mut self, kpage: VirtualAddress) {
        let num = self.frame_number(kpage).as_usize();
        let (word_idx, bit) = (num / 64, num % 64);
        assert!(
            self.bitmap[word_idx] & (1 << bit) != 0,
            "freeing an unallocated user frame at {}",
            kpage
        );
        self.bitmap[word_idx] &= !(1 << bit);
        self.used -= 1;
    }

    /// Frame number of a kernel virtual address inside the pool.
    ///
    /// # Panics
    /// Panics if `kpage` is outside the pool or not page aligned.
    pub fn frame_number(&self, kpage: VirtualAddress) -> FrameNumber {
        let addr = kpage.as_usize();
        assert!(addr % PAGE_SIZE == 0, "kpage {} is not page aligned", kpage);
        assert!(
            addr >= self.base && addr < self.base + self.page_count * PAGE_SIZE,
            "kpage {} is outside the user pool",
            kpage
        );
        FrameNumber::new((addr - self.base) / PAGE_SIZE)
    }

    /// Kernel virtual address of a frame number.
    pub fn kpage(&self, frame: FrameNumber) -> VirtualAddress {
        assert!(frame.as_usize() < self.page_count);
        VirtualAddress::new(self.base + frame.as_usize() * PAGE_SIZE)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total_frames: self.page_count,
            used_frames: self.used,
        }
    }
}

// ===========================================================================
// Global Instance
// ===========================================================================

static USER_POOL: Subsystem<UserPool> = Subsystem::new("user pool");

/// Hand the user-frame arena to the pool. Called once at boot.
pub fn init(base: *mut u8, page_count: usize) {
    USER_POOL.install(UserPool::new(base, page_count));
    log::info!("[PALLOC] User pool: {} frames at {:p}", page_count, base);
}

/// Allocate a user frame, or `None` under memory pressure.
pub fn alloc_page(flags: AllocFlags) -> Option<VirtualAddress> {
    USER_POOL.with(|pool| pool.alloc_page(flags))
}

/// Return a user frame to the pool.
pub fn free_page(kpage: VirtualAddress) {
    USER_POOL.with(|pool| pool.free_page(kpage));
}

/// Frame number for a pool address.
pub fn frame_number_of(kpage: VirtualAddress) -> FrameNumber {
    USER_POOL.with(|pool| pool.frame_number(kpage))
}

/// Pool address for a frame number.
pub fn kpage_of(frame: FrameNumber) -> VirtualAddress {
    USER_POOL.with(|pool| pool.kpage(frame))
}

pub fn stats() -> PoolStats {
    USER_POOL.with(|pool| pool.stats())
}

pub fn is_initialized() -> bool {
    USER_POOL.is_installed()
}
