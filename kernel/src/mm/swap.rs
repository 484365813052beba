//! Swap store
//!
//! A contiguous block device divided into page-sized slots. Dirty pages are
//! written here at eviction time and read back (and the slot freed) when
//! the owner faults on them again. Free slots are tracked by a bitmap under
//! its own lock; the block device itself is a seam the boot code fills in.
//!
//! Running out of swap is fatal in this kernel -- there is nowhere left to
//! put the page and dropping it would corrupt the process.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use super::{VirtualAddress, PAGE_SIZE};
use crate::sync::Subsystem;

/// Size of one device sector
pub const SECTOR_SIZE: usize = 512;

/// Sectors per page-sized swap slot
pub const SECTORS_PER_SLOT: usize = PAGE_SIZE / SECTOR_SIZE;

/// The block device the swap store writes through.
///
/// Sector I/O either succeeds or does not return: storage failure on the
/// swap device leaves the kernel with no correct continuation, so device
/// implementations panic rather than report errors.
pub trait BlockDevice: Send + Sync {
    fn sector_count(&self) -> usize;
    /// Read one sector into `buf` (`SECTOR_SIZE` bytes).
    fn read_sector(&self, sector: usize, buf: &mut [u8]);
    /// Write one sector from `buf` (`SECTOR_SIZE` bytes).
    fn write_sector(&self, sector: usize, buf: &[u8]);
}

/// Index of a page-sized slot on the swap device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub const fn as_usize(&self) -> usize {
        self.0
    }
}

/// Free-slot bitmap, one bit per slot, set = in use
struct SlotMap {
    bits: Vec<u64>,
    slot_count: usize,
    used: usize,
}

impl SlotMap {
    fn new(slot_count: usize) -> Self {
        Self {
            bits: vec![0u64; slot_count.div_ceil(64)],
            slot_count,
            used: 0,
        }
    }

    fn allocate(&mut self) -> Option<SwapSlot> {
        let (word_idx, bit) = self
            .bits
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
            .filter(|&(i, bit)| i * 64 + bit < self.slot_count)?;
        self.bits[word_idx] |= 1 << bit;
        self.used += 1;
        Some(SwapSlot(word_idx * 64 + bit))
    }

    fn release(&mut self, slot: SwapSlot) {
        let (word_idx, bit) = (slot.0 / 64, slot.0 % 64);
        assert!(slot.0 < self.slot_count, "swap slot {} out of range", slot.0);
        assert!(
            self.bits[word_idx] & (1 << bit) != 0,
            "freeing free swap slot {}",
            slot.0
        );
        self.bits[word_idx] &= !(1 << bit);
        self.used -= 1;
    }
}

/// The swap store: a block device plus the slot bitmap
pub struct SwapStore {
    device: Box<dyn BlockDevice>,
    free_map: Mutex<SlotMap>,
}

impl SwapStore {
    pub fn new(device: Box<dyn BlockDevice>) -> Self {
        let slots = device.sector_count() / SECTORS_PER_SLOT;
        log::info!("[SWAP] {} slots available", slots);
        Self {
            device,
            free_map: Mutex::new(SlotMap::new(slots)),
        }
    }

    /// Write the page at `kpage` to a fresh slot and return it.
    ///
    /// The caller must have exclusive access to the frame (it holds the
    /// frame lock during eviction).
    ///
    /// # Panics
    /// Panics when no slot is free.
    pub fn swap_out(&self, kpage: VirtualAddress) -> SwapSlot {
        let slot = self
            .free_map
            .lock()
            .allocate()
            .unwrap_or_else(|| panic!("swap device full while evicting {}", kpage));

        // SAFETY: kpage addresses a full user-pool frame and the caller
        // guarantees exclusive access for the duration of the write.
        let page = unsafe { core::slice::from_raw_parts(kpage.as_ptr(), PAGE_SIZE) };
        for (i, sector) in page.chunks_exact(SECTOR_SIZE).enumerate() {
            self.device
                .write_sector(slot.0 * SECTORS_PER_SLOT + i, sector);
        }
        slot
    }

    /// Read the contents of `slot` into the page at `kpage`, then free the
    /// slot (the page is no longer on disk afterwards).
    pub fn swap_in(&self, slot: SwapSlot, kpage: VirtualAddress) {
        // SAFETY: kpage addresses a full user-pool frame and the caller
        // guarantees exclusive access for the duration of the read.
        let page = unsafe { core::slice::from_raw_parts_mut(kpage.as_mut_ptr(), PAGE_SIZE) };
        for (i, sector) in page.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            self.device
                .read_sector(slot.0 * SECTORS_PER_SLOT + i, sector);
        }
        self.free_map.lock().release(slot);
    }

    /// Return a slot to the free pool without reading it (the owning page
    /// was discarded).
    pub fn swap_free(&self, slot: SwapSlot) {
        self.free_map.lock().release(slot);
    }

    /// Number of slots currently in use
    pub fn used_slots(&self) -> usize {
        self.free_map.lock().used
    }
}

// ===========================================================================
// Global Instance
// ===========================================================================

static SWAP: Subsystem<SwapStore> = Subsystem::new("swap store");

/// Hand the swap block device to the store. Called once at boot.
pub fn init(device: Box<dyn BlockDevice>) {
    SWAP.install(SwapStore::new(device));
}

pub fn swap_out(kpage: VirtualAddress) -> SwapSlot {
    SWAP.with(|store| store.swap_out(kpage))
}

pub fn swap_in(slot: SwapSlot, kpage: VirtualAddress) {
    SWAP.with(|store| store.swap_in(slot, kpage))
}

pub fn swap_free(slot: SwapSlot) {
    SWAP.with(|store| store.swap_free(slot))
}

pub fn used_slots() -> usize {
    SWAP.with(|store| store.used_slots())
}

pub fn is_initialized() -> bool {
    SWAP.is_installed()
}

// ===========================================================================
// Test device
// ===========================================================================

/// An in-memory block device for tests.
#[cfg(test)]
pub(crate) mod test_device {
    use alloc::vec;
    use alloc::vec::Vec;

    use spin::Mutex;

    use super::{BlockDevice, SECTOR_SIZE};

    pub struct RamDisk {
        sectors: usize,
        data: Mutex<Vec<u8>>,
    }

    impl RamDisk {
        pub fn new(sectors: usize) -> Self {
            Self {
                sectors,
                data: Mutex::new(vec![0u8; sectors * SECTOR_SIZE]),
            }
        }
    }

    impl BlockDevice for RamDisk {
        fn sector_count(&self) -> usize {
            self.sectors
        }

        fn read_sector(&self, sector: usize, buf: &mut [u8]) {
            assert!(sector < self.sectors);
            let data = self.data.lock();
            buf.copy_from_slice(&data[sector * SECTOR_SIZE..(sector + 1) * SECTOR_SIZE]);
        }

        fn write_sector(&self, sector: usize, buf: &[u8]) {
            assert!(sector < self.sectors);
            let mut data = self.data.lock();
            data[sector * SECTOR_SIZE..(sector + 1) * SECTOR_SIZE].copy_from_slice(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;
    use alloc::vec;

    use super::test_device::RamDisk;
    use super::*;

    fn store_with_slots(slots: usize) -> SwapStore {
        SwapStore::new(Box::new(RamDisk::new(slots * SECTORS_PER_SLOT)))
    }

    fn page_buffer(fill: u8) -> Box<[u8]> {
        vec![fill; PAGE_SIZE].into_boxed_slice()
    }

    #[test]
    fn test_swap_round_trip_restores_bytes() {
        let store = store_with_slots(2);

        let mut out = page_buffer(0);
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let slot = store.swap_out(VirtualAddress::new(out.as_ptr() as usize));
        assert_eq!(store.used_slots(), 1);

        let mut back = page_buffer(0);
        store.swap_in(slot, VirtualAddress::new(back.as_mut_ptr() as usize));
        assert_eq!(&out[..], &back[..]);
        // swap_in frees the slot
        assert_eq!(store.used_slots(), 0);
    }

    #[test]
    fn test_slots_are_distinct() {
        let store = store_with_slots(2);
        let a = page_buffer(0xAA);
        let b = page_buffer(0xBB);
        let slot_a = store.swap_out(VirtualAddress::new(a.as_ptr() as usize));
        let slot_b = store.swap_out(VirtualAddress::new(b.as_ptr() as usize));
        assert_ne!(slot_a, slot_b);

        let mut back = page_buffer(0);
        store.swap_in(slot_a, VirtualAddress::new(back.as_mut_ptr() as usize));
        assert!(back.iter().all(|&byte| byte == 0xAA));
    }

    #[test]
    fn test_swap_free_without_read() {
        let store = store_with_slots(1);
        let page = page_buffer(1);
        let slot = store.swap_out(VirtualAddress::new(page.as_ptr() as usize));
        store.swap_free(slot);
        assert_eq!(store.used_slots(), 0);

        // The slot is reusable afterwards
        let slot = store.swap_out(VirtualAddress::new(page.as_ptr() as usize));
        assert_eq!(slot.as_usize(), 0);
    }

    #[test]
    #[should_panic(expected = "swap device full")]
    fn test_exhaustion_is_fatal() {
        let store = store_with_slots(1);
        let page = page_buffer(1);
        let _ = store.swap_out(VirtualAddress::new(page.as_ptr() as usize));
        let _ = store.swap_out(VirtualAddress::new(page.as_ptr() as usize));
    }

    #[test]
    #[should_panic(expected = "freeing free swap slot")]
    fn test_double_free_panics() {
        let store = store_with_slots(1);
        let page = page_buffer(1);
        let slot = store.swap_out(VirtualAddress::new(page.as_ptr() as usize));
        store.swap_free(slot);
        store.swap_free(slot);
    }
}
