//! Supplemental page tables and demand paging
//!
//! Each process owns a supplemental page table (SPT): a map from user
//! virtual page to a [`Page`] describing how that page is materialized
//! when it faults in -- zero-filled, read from a file, or read back from a
//! swap slot. No physical memory is committed at registration time; the
//! first access faults and [`load`] pulls the page in through the frame
//! table, which may evict somebody else's page to make room.
//!
//! Lock order on the fault path: a process's own SPT lock is taken only
//! for short lookups and updates, never across a call into the frame
//! table. The eviction path reaches into the *victim's* SPT while holding
//! the frame-table lock and the victim's frame lock; that is safe because
//! any operation the victim could run on the same page needs that frame
//! lock first.

use alloc::sync::Arc;
use alloc::vec::Vec;
use alloc::collections::BTreeMap;

use super::frame_table;
use super::swap::{self, SwapSlot};
use super::{FrameNumber, VirtualAddress, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::process::{self, Process};

/// Readable backing for file-backed pages.
///
/// The file system is an external collaborator; the loader registers
/// segments with whatever implements this.
pub trait BackingFile: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`, returning how many were
    /// read.
    fn read_at(&self, buf: &mut [u8], offset: usize) -> KernelResult<usize>;
}

/// How a page's contents are produced when it faults in.
#[derive(Clone)]
pub enum Backing {
    /// Zero-filled on first access
    Zero,
    /// Read `bytes` bytes from `file` at `offset`; the tail of the page
    /// is zero-filled
    File {
        file: Arc<dyn BackingFile>,
        offset: usize,
        bytes: usize,
    },
    /// Read back from a swap slot (the page was evicted dirty)
    Swap { slot: SwapSlot },
}

impl core::fmt::Debug for Backing {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Zero => write!(f, "Zero"),
            Self::File { offset, bytes, .. } => f
                .debug_struct("File")
                .field("offset", offset)
                .field("bytes", bytes)
                .finish(),
            Self::Swap { slot } => f.debug_struct("Swap").field("slot", slot).finish(),
        }
    }
}

/// One supplemental page table entry.
#[derive(Debug)]
pub struct Page {
    pub(crate) backing: Backing,
    pub(crate) writable: bool,
    /// Sticky dirty bit: once the page has ever been observed dirty it
    /// stays dirty until discarded, so a clean-looking eviction can never
    /// drop contents that only exist in RAM or on swap.
    pub(crate) dirty: bool,
    /// The resident frame, if any
    pub(crate) frame: Option<FrameNumber>,
}

/// Per-process map from user virtual page to page descriptor.
pub struct SuppPageTable {
    pub(crate) entries: BTreeMap<VirtualAddress, Page>,
}

impl SuppPageTable {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SuppPageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Register a page of `process`'s address space for demand paging.
///
/// Only the description is created; the frame arrives on first fault.
/// Fails with `AlreadyExists` on duplicate registration and
/// `InvalidAddress` if `upage` is not a page-aligned user address.
pub fn register_page(
    process: &Process,
    upage: VirtualAddress,
    backing: Backing,
    writable: bool,
) -> KernelResult<()> {
    if !upage.is_page_aligned() || !upage.is_user() {
        return Err(KernelError::InvalidAddress {
            addr: upage.as_usize(),
        });
    }
    if let Backing::File { bytes, .. } = &backing {
        debug_assert!(*bytes <= PAGE_SIZE);
    }

    let mut spt = process.spt.lock();
    if spt.entries.contains_key(&upage) {
        return Err(KernelError::AlreadyExists {
            addr: upage.as_usize(),
        });
    }
    spt.entries.insert(
        upage,
        Page {
            backing,
            writable,
            dirty: false,
            frame: None,
        },
    );
    Ok(())
}

/// Whether `process` has an SPT entry for `upage`.
pub fn is_registered(process: &Process, upage: VirtualAddress) -> bool {
    process.spt.lock().entries.contains_key(&upage)
}

/// Whether the page is currently resident in a frame.
pub fn is_resident(process: &Process, upage: VirtualAddress) -> bool {
    process
        .spt
        .lock()
        .entries
        .get(&upage)
        .is_some_and(|page| page.frame.is_some())
}

/// The frame `upage` is resident in, if any.
pub fn frame_of(process: &Process, upage: VirtualAddress) -> Option<FrameNumber> {
    process.spt.lock().entries.get(&upage).and_then(|p| p.frame)
}

/// Ensure the page at `upage` is resident and mapped.
///
/// Loading an already-resident page is a no-op. The SPT lock is never
/// held across the frame-table call: operations on the same page by the
/// owning process are serialized above us (one thread per process), and
/// a non-resident entry cannot be touched by eviction.
pub fn load(process: &Arc<Process>, upage: VirtualAddress) -> KernelResult<()> {
    debug_assert!(upage.is_page_aligned());

    let (backing, writable) = {
        let spt = process.spt.lock();
        let page = spt
            .entries
            .get(&upage)
            .ok_or(KernelError::UnmappedMemory {
                addr: upage.as_usize(),
            })?;
        if page.frame.is_some() {
            return Ok(());
        }
        (page.backing.clone(), page.writable)
    };

    // A locked frame bound to (process, upage); possibly somebody else's
    // page was just evicted to produce it.
    let frame = frame_table::alloc(process, upage);
    let executor = process.pid();
    let kpage = frame.kpage();

    if let Err(e) = populate(&backing, kpage) {
        frame_table::free(&frame, executor);
        return Err(e);
    }

    {
        let mut spt = process.spt.lock();
        let page = spt
            .entries
            .get_mut(&upage)
            .expect("SPT entry vanished during load");
        page.frame = Some(frame.number());
        if matches!(backing, Backing::Swap { .. }) {
            // The slot was freed by swap_in; the page lives only in RAM
            // now (its sticky dirty bit will send it back to swap).
            page.backing = Backing::Zero;
        }
    }

    let install = process
        .pagedir
        .lock()
        .set_page(upage, frame.number(), writable);
    if let Err(e) = install {
        process
            .spt
            .lock()
            .entries
            .get_mut(&upage)
            .expect("SPT entry vanished during load")
            .frame = None;
        frame_table::free(&frame, executor);
        return Err(e);
    }

    {
        let mut pagedir = process.pagedir.lock();
        pagedir.set_accessed(upage, false);
        pagedir.set_dirty(upage, false);
    }

    frame.lock_release(executor);
    Ok(())
}

/// Fill a freshly allocated frame according to the page's backing.
fn populate(backing: &Backing, kpage: VirtualAddress) -> KernelResult<()> {
    // SAFETY: kpage addresses a full user-pool frame whose lock the
    // caller holds, so this is the only reference to its contents.
    let buf = unsafe { core::slice::from_raw_parts_mut(kpage.as_mut_ptr(), PAGE_SIZE) };
    match backing {
        Backing::Zero => {
            buf.fill(0);
        }
        Backing::File {
            file,
            offset,
            bytes,
        } => {
            let got = file.read_at(&mut buf[..*bytes], *offset)?;
            if got != *bytes {
                return Err(KernelError::IoError {
                    expected: *bytes,
                    got,
                });
            }
            buf[*bytes..].fill(0);
        }
        Backing::Swap { slot } => {
            swap::swap_in(*slot, kpage);
        }
    }
    Ok(())
}

/// Read and clear the hardware accessed bit for a resident page. The
/// clock sweep's second-chance test.
pub fn was_accessed(owner: &Process, upage: VirtualAddress) -> bool {
    let mut pagedir = owner.pagedir.lock();
    let accessed = pagedir.is_accessed(upage);
    if accessed {
        pagedir.set_accessed(upage, false);
    }
    accessed
}

/// Detach `upage` from the frame it occupies, writing it to swap if
/// dirty. Called by the frame table during eviction with the frame-table
/// lock and the frame's lock held; the frame is about to be rebound to
/// its beneficiary.
pub(crate) fn page_evicted(owner: &Arc<Process>, upage: VirtualAddress, kpage: VirtualAddress) {
    // Invalidate the mapping first so no further hardware writes can land,
    // then fold the PTE dirty bit into the sticky SPT bit.
    let hw_dirty = {
        let mut pagedir = owner.pagedir.lock();
        pagedir.clear_page(upage);
        pagedir.is_dirty(upage)
    };

    let mut spt = owner.spt.lock();
    let page = spt
        .entries
        .get_mut(&upage)
        .expect("evicted page has no SPT entry");
    debug_assert_eq!(page.frame.map(super::frame_allocator::kpage_of), Some(kpage));

    page.dirty |= hw_dirty;
    if page.dirty {
        let slot = swap::swap_out(kpage);
        page.backing = Backing::Swap { slot };
    }
    page.frame = None;
}

/// Process-exit hook: release every frame and swap slot the process owns
/// and drop its supplemental page table.
pub fn cleanup(process: &Arc<Process>) {
    let executor = process.pid();
    let upages: Vec<VirtualAddress> = process.spt.lock().entries.keys().copied().collect();

    for upage in upages {
        let resident = process.spt.lock().entries.get(&upage).and_then(|p| p.frame);
        if let Some(number) = resident {
            if let Some(frame) = frame_table::get(number) {
                // Wait out any in-flight eviction of this frame, then
                // re-check it is still ours -- it may have just been
                // rebound to another process's page.
                frame.lock_acquire(executor);
                if frame.is_bound_to(executor, upage) {
                    process.pagedir.lock().clear_page(upage);
                    frame_table::free(&frame, executor);
                } else {
                    frame.lock_release(executor);
                }
            }
        }

        let mut spt = process.spt.lock();
        if let Some(page) = spt.entries.remove(&upage) {
            if let Backing::Swap { slot } = page.backing {
                swap::swap_free(slot);
            }
        }
    }

    process.pagedir.lock().clear_all();
}
