//! Per-process hardware page tables
//!
//! Two-level paging: a page directory of 1024 entries, each pointing at a
//! page table of 1024 entries covering 4 MiB. Entries are the 32-bit PTE
//! format the MMU walks; the accessed and dirty bits in them are set by
//! hardware as a side effect of user memory access, and the VM core reads
//! (and clears) them through the accessors here.
//!
//! Frame references inside entries are [`FrameNumber`]s -- indices into the
//! user pool -- so a page directory never holds a raw pointer to frame
//! memory.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use bitflags::bitflags;

use super::{FrameNumber, VirtualAddress, PGBITS};
use crate::arch::x86::mmu;
use crate::error::{KernelError, KernelResult};

/// Number of entries in a page directory or page table
pub const PAGE_TABLE_ENTRIES: usize = 1024;

bitflags! {
    /// Page table entry flag bits (i386 layout)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        /// Mapping is valid; the MMU may use it
        const PRESENT = 1 << 0;
        /// Writes are permitted
        const WRITABLE = 1 << 1;
        /// User-mode access is permitted
        const USER = 1 << 2;
        /// Set by the MMU on any access through this entry
        const ACCESSED = 1 << 5;
        /// Set by the MMU on any write through this entry
        const DIRTY = 1 << 6;
    }
}

/// Page table entry
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry {
    entry: u32,
}

impl PageTableEntry {
    /// Create an empty/unused entry
    pub const fn empty() -> Self {
        Self { entry: 0 }
    }

    pub const fn is_unused(&self) -> bool {
        self.entry == 0
    }

    pub const fn is_present(&self) -> bool {
        self.entry & PteFlags::PRESENT.bits() != 0
    }

    /// The physical frame this entry points to, if any was ever installed
    pub fn frame(&self) -> Option<FrameNumber> {
        if self.is_unused() {
            None
        } else {
            Some(FrameNumber::new((self.entry >> PGBITS) as usize))
        }
    }

    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.entry)
    }

    /// Point this entry at `frame` with the given flags
    pub fn set(&mut self, frame: FrameNumber, flags: PteFlags) {
        self.entry = ((frame.as_usize() as u32) << PGBITS) | flags.bits();
    }

    fn insert_flags(&mut self, flags: PteFlags) {
        self.entry |= flags.bits();
    }

    fn remove_flags(&mut self, flags: PteFlags) {
        self.entry &= !flags.bits();
    }

    pub fn clear(&mut self) {
        self.entry = 0;
    }
}

/// A page table with 1024 entries
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: [PageTableEntry::empty(); PAGE_TABLE_ENTRIES],
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A per-process page directory.
///
/// Page tables are allocated lazily the first time a mapping lands in
/// their 4 MiB window and freed only at process teardown.
pub struct PageDirectory {
    tables: BTreeMap<usize, Box<PageTable>>,
}

impl PageDirectory {
    pub fn new() -> Self {
        Self {
            tables: BTreeMap::new(),
        }
    }

    fn pde_index(upage: VirtualAddress) -> usize {
        upage.as_usize() >> (PGBITS + 10)
    }

    fn pte_index(upage: VirtualAddress) -> usize {
        (upage.as_usize() >> PGBITS) & (PAGE_TABLE_ENTRIES - 1)
    }

    fn entry(&self, upage: VirtualAddress) -> Option<&PageTableEntry> {
        self.tables
            .get(&Self::pde_index(upage))
            .map(|table| &table.entries[Self::pte_index(upage)])
    }

    fn entry_mut(&mut self, upage: VirtualAddress) -> Option<&mut PageTableEntry> {
        self.tables
            .get_mut(&Self::pde_index(upage))
            .map(|table| &mut table.entries[Self::pte_index(upage)])
    }

    /// Install a mapping `upage -> frame` with user permission and
    /// writability per `writable`. The accessed and dirty bits start clear.
    ///
    /// Fails if `upage` is not a page-aligned user address; the caller
    /// rolls its frame allocation back.
    ///
    /// # Panics
    /// Panics if a present mapping already exists -- installing over a
    /// live mapping is a kernel bug.
    pub fn set_page(
        &mut self,
        upage: VirtualAddress,
        frame: FrameNumber,
        writable: bool,
    ) -> KernelResult<()> {
        if !upage.is_page_aligned() || !upage.is_user() {
            return Err(KernelError::InvalidAddress {
                addr: upage.as_usize(),
            });
        }

        let table = self
            .tables
            .entry(Self::pde_index(upage))
            .or_insert_with(|| Box::new(PageTable::new()));

        let entry = &mut table.entries[Self::pte_index(upage)];
        if entry.is_present() {
            panic!("remapping live page {}", upage);
        }

        let mut flags = PteFlags::PRESENT | PteFlags::USER;
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        entry.set(frame, flags);
        Ok(())
    }

    /// Invalidate the mapping for `upage` and flush its cached
    /// translation. The entry itself survives so that the accessed and
    /// dirty bits remain readable (eviction consumes them after the
    /// mapping is gone).
    pub fn clear_page(&mut self, upage: VirtualAddress) {
        if let Some(entry) = self.entry_mut(upage) {
            entry.remove_flags(PteFlags::PRESENT);
        }
        mmu::flush_tlb_page(upage);
    }

    /// Look up the entry for `upage`, present or not.
    pub fn lookup(&self, upage: VirtualAddress) -> Option<PageTableEntry> {
        self.entry(upage).copied()
    }

    /// The frame `upage` currently maps to, if the mapping is present.
    pub fn translate(&self, upage: VirtualAddress) -> Option<FrameNumber> {
        self.entry(upage)
            .filter(|entry| entry.is_present())
            .and_then(PageTableEntry::frame)
    }

    pub fn is_accessed(&self, upage: VirtualAddress) -> bool {
        self.entry(upage)
            .is_some_and(|entry| entry.flags().contains(PteFlags::ACCESSED))
    }

    pub fn set_accessed(&mut self, upage: VirtualAddress, accessed: bool) {
        if let Some(entry) = self.entry_mut(upage) {
            if accessed {
                entry.insert_flags(PteFlags::ACCESSED);
            } else {
                entry.remove_flags(PteFlags::ACCESSED);
            }
        }
    }

    pub fn is_dirty(&self, upage: VirtualAddress) -> bool {
        self.entry(upage)
            .is_some_and(|entry| entry.flags().contains(PteFlags::DIRTY))
    }

    pub fn set_dirty(&mut self, upage: VirtualAddress, dirty: bool) {
        if let Some(entry) = self.entry_mut(upage) {
            if dirty {
                entry.insert_flags(PteFlags::DIRTY);
            } else {
                entry.remove_flags(PteFlags::DIRTY);
            }
        }
    }

    /// Drop every mapping and page table. Process teardown only; the
    /// frames themselves are returned to the pool by the frame table.
    pub fn clear_all(&mut self) {
        self.tables.clear();
        mmu::flush_tlb();
    }
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPAGE: VirtualAddress = VirtualAddress::new(0x8048000);

    #[test]
    fn test_set_and_translate() {
        let mut pd = PageDirectory::new();
        assert_eq!(pd.translate(UPAGE), None);

        pd.set_page(UPAGE, FrameNumber::new(7), true).unwrap();
        assert_eq!(pd.translate(UPAGE), Some(FrameNumber::new(7)));

        let entry = pd.lookup(UPAGE).unwrap();
        assert!(entry.flags().contains(PteFlags::PRESENT));
        assert!(entry.flags().contains(PteFlags::USER));
        assert!(entry.flags().contains(PteFlags::WRITABLE));
    }

    #[test]
    fn test_read_only_mapping() {
        let mut pd = PageDirectory::new();
        pd.set_page(UPAGE, FrameNumber::new(1), false).unwrap();
        assert!(!pd.lookup(UPAGE).unwrap().flags().contains(PteFlags::WRITABLE));
    }

    #[test]
    fn test_new_mapping_starts_clean() {
        let mut pd = PageDirectory::new();
        pd.set_page(UPAGE, FrameNumber::new(1), true).unwrap();
        assert!(!pd.is_accessed(UPAGE));
        assert!(!pd.is_dirty(UPAGE));
    }

    #[test]
    fn test_dirty_survives_clear_page() {
        let mut pd = PageDirectory::new();
        pd.set_page(UPAGE, FrameNumber::new(3), true).unwrap();
        pd.set_dirty(UPAGE, true);
        pd.set_accessed(UPAGE, true);

        pd.clear_page(UPAGE);
        assert_eq!(pd.translate(UPAGE), None, "mapping must be gone");
        assert!(pd.is_dirty(UPAGE), "dirty bit must survive invalidation");
        assert!(pd.is_accessed(UPAGE));
    }

    #[test]
    fn test_reinstall_after_clear() {
        let mut pd = PageDirectory::new();
        pd.set_page(UPAGE, FrameNumber::new(3), true).unwrap();
        pd.set_dirty(UPAGE, true);
        pd.clear_page(UPAGE);

        pd.set_page(UPAGE, FrameNumber::new(9), true).unwrap();
        assert_eq!(pd.translate(UPAGE), Some(FrameNumber::new(9)));
        // A fresh install replaces the whole entry, stale bits included.
        assert!(!pd.is_dirty(UPAGE));
    }

    #[test]
    #[should_panic(expected = "remapping live page")]
    fn test_remap_panics() {
        let mut pd = PageDirectory::new();
        pd.set_page(UPAGE, FrameNumber::new(1), true).unwrap();
        pd.set_page(UPAGE, FrameNumber::new(2), true).unwrap();
    }

    #[test]
    fn test_pages_in_distinct_tables() {
        let mut pd = PageDirectory::new();
        let far = VirtualAddress::new(0x40000000);
        pd.set_page(UPAGE, FrameNumber::new(1), true).unwrap();
        pd.set_page(far, FrameNumber::new(2), true).unwrap();
        assert_eq!(pd.translate(UPAGE), Some(FrameNumber::new(1)));
        assert_eq!(pd.translate(far), Some(FrameNumber::new(2)));
    }
}
