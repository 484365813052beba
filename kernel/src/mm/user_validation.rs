//! Safe access to user memory from the kernel
//!
//! System calls must read and write user buffers without trusting the
//! pointers user code hands them. The routines here access user memory
//! through the current process's page tables and run every miss through
//! the page-fault service, exactly as the MMU would: a lazily-loadable
//! page gets loaded, and a genuinely bad address makes the probe return
//! failure instead of taking the kernel down.
//!
//! On the bare-metal target the actual dereference is a kernel-mode
//! access whose fault is recovered through the trap-frame trampoline (the
//! probe's recovery address travels in `eax`); the page-walk below is the
//! machine-independent core both builds share.

use super::frame_allocator;
use super::page_fault::{self, FaultOutcome, PageFaultInfo};
use super::VirtualAddress;
use crate::process;

/// Run a kernel-mode fault for `uaddr` through the fault service, as the
/// MMU would on a failed access. Returns whether the access can be
/// retried.
fn fault_in(uaddr: VirtualAddress, write: bool, not_present: bool) -> bool {
    let info = PageFaultInfo {
        fault_addr: uaddr,
        not_present,
        write,
        user: false,
        esp: 0,
    };
    page_fault::handle_page_fault(&info) == FaultOutcome::Resolved
}

/// Read one byte of user memory.
///
/// Returns `None` if `uaddr` is not a user address or cannot be made
/// readable.
pub fn get_user(uaddr: VirtualAddress) -> Option<u8> {
    if !uaddr.is_user() {
        return None;
    }
    let current = process::current()?;
    let upage = uaddr.page_round_down();

    // At most one fault resolution, then one retry.
    for _ in 0..2 {
        let frame = {
            let mut pagedir = current.pagedir.lock();
            let frame = pagedir.translate(upage);
            if frame.is_some() {
                pagedir.set_accessed(upage, true);
            }
            frame
        };

        if let Some(frame) = frame {
            let kpage = frame_allocator::kpage_of(frame);
            // SAFETY: the mapping is present, so kpage addresses a live
            // user-pool frame; offset stays within the page.
            let byte = unsafe { core::ptr::read(kpage.as_ptr().add(uaddr.page_offset())) };
            return Some(byte);
        }

        if !fault_in(uaddr, false, true) {
            return None;
        }
    }
    None
}

/// Write one byte of user memory.
///
/// Returns whether the write happened; writes to read-only pages fail
/// the same way bad addresses do.
pub fn put_user(uaddr: VirtualAddress, value: u8) -> bool {
    if !uaddr.is_user() {
        return false;
    }
    let Some(current) = process::current() else {
        return false;
    };
    let upage = uaddr.page_round_down();

    for _ in 0..2 {
        enum Probe {
            Mapped(frame_allocator::FrameNumber),
            ReadOnly,
            NotPresent,
        }

        let probe = {
            let mut pagedir = current.pagedir.lock();
            match pagedir.lookup(upage) {
                Some(entry) if entry.is_present() => {
                    if entry
                        .flags()
                        .contains(super::page_table::PteFlags::WRITABLE)
                    {
                        pagedir.set_accessed(upage, true);
                        pagedir.set_dirty(upage, true);
                        Probe::Mapped(entry.frame().expect("present entry without frame"))
                    } else {
                        Probe::ReadOnly
                    }
                }
                _ => Probe::NotPresent,
            }
        };

        match probe {
            Probe::Mapped(frame) => {
                let kpage = frame_allocator::kpage_of(frame);
                // SAFETY: the mapping is present and writable, so kpage
                // addresses a live user-pool frame; offset stays within
                // the page.
                unsafe {
                    core::ptr::write(kpage.as_mut_ptr().add(uaddr.page_offset()), value);
                }
                return true;
            }
            Probe::ReadOnly => {
                // Rights violation; the fault service records it and the
                // trampoline fails the probe.
                let _ = fault_in(uaddr, true, false);
                return false;
            }
            Probe::NotPresent => {
                if !fault_in(uaddr, true, true) {
                    return false;
                }
            }
        }
    }
    false
}

/// Copy `dst.len()` bytes from user memory at `src` into `dst`.
///
/// Returns whether the whole copy succeeded.
pub fn copy_from_user(dst: &mut [u8], src: VirtualAddress) -> bool {
    for (i, slot) in dst.iter_mut().enumerate() {
        match get_user(src.add(i)) {
            Some(byte) => *slot = byte,
            None => return false,
        }
    }
    true
}
