//! Global frame table and clock eviction
//!
//! Every physical user frame in use is registered here. Allocation first
//! tries the user pool; under pressure it selects a victim with the clock
//! (second-chance) algorithm and rebinds the victim's frame to the new
//! page, writing the old contents to swap when they are dirty.
//!
//! Lock order, outermost first: frame-table lock, per-frame lock, the
//! victim's page tables, swap bitmap. The one deliberate inversion is
//! [`free`], which takes the table lock while already holding a frame
//! lock; that cannot deadlock because a table-lock holder only ever
//! *try*-acquires frame locks (the clock scan) and so never waits on one.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use lazy_static::lazy_static;
use spin::Mutex;

use super::demand_paging;
use super::frame_allocator::{self, AllocFlags};
use super::{FrameNumber, VirtualAddress};
use crate::process::{self, Process, ProcessId};
use crate::sync::HeldLock;

/// The page a frame currently holds
#[derive(Debug, Clone, Copy)]
struct Binding {
    owner: ProcessId,
    upage: VirtualAddress,
}

/// Descriptor for one allocated physical user frame.
pub struct Frame {
    number: FrameNumber,
    kpage: VirtualAddress,
    /// Held while the frame is being populated, evicted or freed
    lock: HeldLock,
    /// Pinned frames are never selected as eviction victims. Pinning is
    /// for I/O paths that need the physical address stable; it does not
    /// replace the lock, which guards the operations themselves.
    pinned: AtomicBool,
    /// The SPT entry mapped here. `None` only transiently during free.
    binding: Mutex<Option<Binding>>,
}

impl Frame {
    pub fn number(&self) -> FrameNumber {
        self.number
    }

    /// Kernel virtual address of the frame's memory
    pub fn kpage(&self) -> VirtualAddress {
        self.kpage
    }

    pub fn lock_acquire(&self, executor: ProcessId) {
        self.lock.acquire(executor.as_u64());
    }

    pub fn lock_release(&self, executor: ProcessId) {
        self.lock.release(executor.as_u64());
    }

    /// Try to take the frame lock; refuses if any executor holds it,
    /// including `executor` itself.
    pub fn lock_try_acquire(&self, executor: ProcessId) -> bool {
        self.lock.try_acquire(executor.as_u64())
    }

    pub fn is_locked_by(&self, executor: ProcessId) -> bool {
        self.lock.is_held_by(executor.as_u64())
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire)
    }

    /// The (owner, upage) pair currently bound to this frame.
    pub fn binding(&self) -> Option<(ProcessId, VirtualAddress)> {
        self.binding.lock().map(|b| (b.owner, b.upage))
    }

    pub fn is_bound_to(&self, owner: ProcessId, upage: VirtualAddress) -> bool {
        self.binding()
            .is_some_and(|(o, u)| o == owner && u == upage)
    }
}

struct FrameTable {
    /// All allocated frames, by frame number
    frames: BTreeMap<usize, Arc<Frame>>,
    /// Eviction scan list: insertion-ordered, scanned cyclically. A frame
    /// leaves the list while its eviction is in progress and rejoins at
    /// the tail afterwards.
    clock: Vec<FrameNumber>,
    /// Index of the next clock candidate
    hand: usize,
}

lazy_static! {
    static ref FRAME_TABLE: Mutex<FrameTable> = Mutex::new(FrameTable {
        frames: BTreeMap::new(),
        clock: Vec::new(),
        hand: 0,
    });
}

/// Allocate a frame for `upage` of `process`, evicting if the pool is
/// exhausted.
///
/// Returns the frame with its lock held by `process` and its binding
/// already pointing at `(process, upage)`; the caller populates the
/// contents, installs the hardware mapping, and releases the lock.
pub fn alloc(process: &Arc<Process>, upage: VirtualAddress) -> Arc<Frame> {
    let pid = process.pid();
    debug_assert!(
        process::current().is_some_and(|c| c.pid() == pid),
        "frame_alloc for a non-current process"
    );

    let mut table = FRAME_TABLE.lock();

    if let Some(kpage) = frame_allocator::alloc_page(AllocFlags::empty()) {
        let number = frame_allocator::frame_number_of(kpage);
        let frame = Arc::new(Frame {
            number,
            kpage,
            lock: HeldLock::new(),
            pinned: AtomicBool::new(false),
            binding: Mutex::new(Some(Binding { owner: pid, upage })),
        });
        frame.lock_acquire(pid);
        table.frames.insert(number.as_usize(), frame.clone());
        table.clock.push(number);
        return frame;
    }

    // Pool exhausted: evict. The victim comes back locked and already
    // removed from the clock list.
    let victim = select_victim(&mut table, pid);
    evict(&mut table, &victim, pid, upage);
    victim
}

/// Clock (second-chance) victim selection. Called with the table lock
/// held; returns the victim locked and removed from the clock list.
fn select_victim(table: &mut FrameTable, executor: ProcessId) -> Arc<Frame> {
    assert!(!table.clock.is_empty(), "no user frames exist to evict");

    let mut steps = 0;
    loop {
        // While user memory is under pressure at least one unpinned,
        // not-in-flux frame must exist; two full sweeps (one to clear
        // accessed bits, one to pick) are enough to find it.
        steps += 1;
        assert!(
            steps <= 4 * table.clock.len() + 4,
            "clock sweep made no progress: every frame pinned or in flux"
        );

        if table.hand >= table.clock.len() {
            table.hand = 0;
        }
        let number = table.clock[table.hand];
        let frame = table.frames[&number.as_usize()].clone();

        if frame.is_pinned() {
            table.hand += 1;
            continue;
        }

        // In flux (or held by ourselves for a pending operation): skip.
        if !frame.lock_try_acquire(executor) {
            table.hand += 1;
            continue;
        }

        let (owner, upage) = frame
            .binding()
            .expect("frame in clock list without a page");
        let owner_proc = process::get(owner).expect("frame owner not registered");

        // Second chance: a recently-used page gets its accessed bit
        // cleared and survives this sweep.
        if demand_paging::was_accessed(&owner_proc, upage) {
            frame.lock_release(executor);
            table.hand += 1;
            continue;
        }

        // Removing the element under the hand leaves the hand pointing
        // at its former successor, which is exactly where the next scan
        // should start.
        table.clock.remove(table.hand);
        return frame;
    }
}

/// Rebind `frame` from its current page to `(beneficiary, upage)`,
/// swapping the old contents out if dirty. Table lock and frame lock
/// held; the frame is out of the clock list and rejoins at the tail.
fn evict(table: &mut FrameTable, frame: &Arc<Frame>, beneficiary: ProcessId, upage: VirtualAddress) {
    let (src_owner, src_upage) = frame
        .binding()
        .expect("evicting a frame without a page");
    let src_process = process::get(src_owner).expect("evicted frame owner not registered");

    log::trace!(
        "[FRAME] evict frame {} ({} page {}) for {} page {}",
        frame.number().as_usize(),
        src_owner.as_u64(),
        src_upage,
        beneficiary.as_u64(),
        upage
    );

    demand_paging::page_evicted(&src_process, src_upage, frame.kpage());

    *frame.binding.lock() = Some(Binding {
        owner: beneficiary,
        upage,
    });
    table.clock.push(frame.number());
}

/// Release `frame` back to the user pool and drop its descriptor.
///
/// The caller must hold the frame's lock; the lock is released here after
/// the descriptor is unlinked.
pub fn free(frame: &Arc<Frame>, executor: ProcessId) {
    assert!(
        frame.is_locked_by(executor),
        "frame_free without holding the frame lock"
    );

    {
        let mut table = FRAME_TABLE.lock();
        if let Some(pos) = table.clock.iter().position(|&n| n == frame.number()) {
            table.clock.remove(pos);
            // Keep the hand on the same next candidate.
            if pos < table.hand {
                table.hand -= 1;
            }
        }
        table.frames.remove(&frame.number().as_usize());
        *frame.binding.lock() = None;
    }

    frame_allocator::free_page(frame.kpage());
    frame.lock_release(executor);
}

/// Atomically pin `frame` if it was not already pinned. Returns whether
/// this call did the pinning; a second `try_pin` on a pinned frame
/// returns false and leaves it pinned.
pub fn try_pin(frame: &Frame) -> bool {
    !frame.pinned.swap(true, Ordering::AcqRel)
}

/// Make `frame` eligible for eviction again.
pub fn unpin(frame: &Frame) {
    frame.pinned.store(false, Ordering::Release);
}

/// Look up an allocated frame by number.
pub fn get(number: FrameNumber) -> Option<Arc<Frame>> {
    FRAME_TABLE.lock().frames.get(&number.as_usize()).cloned()
}

/// Number of allocated frames.
pub fn frame_count() -> usize {
    FRAME_TABLE.lock().frames.len()
}

#[cfg(test)]
pub(crate) fn clock_list() -> Vec<FrameNumber> {
    FRAME_TABLE.lock().clock.clone()
}

#[cfg(test)]
pub(crate) fn hand_index() -> usize {
    FRAME_TABLE.lock().hand
}
