//! Machine-independent page fault service
//!
//! The arch page-fault entry collects the fault address and error-code
//! bits into a [`PageFaultInfo`] and delegates here. This layer decides
//! what the fault *means* -- lazy load, stack growth, swap-in, kernel
//! probe recovery, or a genuinely bad access -- and reports the decision
//! as a [`FaultOutcome`] for the entry to apply to the trap frame.

use core::sync::atomic::{AtomicU64, Ordering};

use super::demand_paging::{self, Backing};
use super::{VirtualAddress, PHYS_BASE, STACK_MAX_SIZE};
use crate::process;

/// All-ones sentinel stored in `eax` by the kernel-mode fault trampoline
/// (`0xFFFF_FFFF` on the 32-bit target). The user-pointer probe routines
/// receive it in place of the byte they tried to access.
pub const SYS_BAD_ADDR: usize = usize::MAX;

/// Width of the window below `esp` in which a fault still counts as a
/// stack access: PUSHA pushes 32 bytes and checks permissions before it
/// decrements the stack pointer.
const STACK_SLOP: usize = 32;

/// A page fault, as reported by the CPU.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultInfo {
    /// The virtual address whose access faulted
    pub fault_addr: VirtualAddress,
    /// True: no mapping was present. False: a rights violation.
    pub not_present: bool,
    /// Whether the access was a write
    pub write: bool,
    /// Whether the access came from user mode
    pub user: bool,
    /// The trap frame's `esp` (the user stack pointer only for faults
    /// taken in user mode)
    pub esp: usize,
}

/// What the arch entry should do about a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page is resident; retry the faulting instruction
    Resolved,
    /// Kernel-mode access to a bad user address: rewrite the trap frame
    /// so the probe routine returns [`SYS_BAD_ADDR`]
    ReturnBadAddr,
    /// Unservicable user access: terminate the process
    Kill,
}

static PAGE_FAULT_COUNT: AtomicU64 = AtomicU64::new(0);

/// Number of page faults processed since boot.
pub fn fault_count() -> u64 {
    PAGE_FAULT_COUNT.load(Ordering::Relaxed)
}

/// Classify and service a page fault.
pub fn handle_page_fault(info: &PageFaultInfo) -> FaultOutcome {
    PAGE_FAULT_COUNT.fetch_add(1, Ordering::Relaxed);

    let fault_page = info.fault_addr.page_round_down();

    let Some(current) = process::current() else {
        // No process context. A user fault without a process cannot
        // happen; a kernel fault here is a probe recovering early in
        // boot or a bug the caller will surface.
        return if info.user {
            FaultOutcome::Kill
        } else {
            FaultOutcome::ReturnBadAddr
        };
    };

    // The user stack pointer: from the trap frame for user faults, from
    // the value saved at the last user-to-kernel transition otherwise
    // (the processor only pushes the user esp on a privilege switch).
    let esp = if info.user {
        info.esp
    } else {
        current.saved_esp()
    };

    // Stack growth: a fault just below (or above) the stack pointer
    // inside the stack ceiling describes a new stack page. Only the
    // description is created here; the not-present branch below
    // materializes it like any other lazy page.
    if stack_access(info.fault_addr, fault_page, esp) {
        let _ = demand_paging::register_page(&current, fault_page, Backing::Zero, true);
    }

    if info.not_present {
        return match demand_paging::load(&current, fault_page) {
            Ok(()) => FaultOutcome::Resolved,
            Err(_) if info.user => FaultOutcome::Kill,
            Err(_) => FaultOutcome::ReturnBadAddr,
        };
    }

    // Rights violation (e.g. write to a read-only page).
    if info.user {
        FaultOutcome::Kill
    } else {
        FaultOutcome::ReturnBadAddr
    }
}

/// The stack-growth test.
///
/// The faulting page must lie inside the 8 MiB stack ceiling below
/// `PHYS_BASE`, and the faulting address must be no lower than 32 bytes
/// below the stack pointer (PUSH faults 4 bytes below `esp`, PUSHA 32).
fn stack_access(fault_addr: VirtualAddress, fault_page: VirtualAddress, esp: usize) -> bool {
    fault_page.as_usize() >= PHYS_BASE - STACK_MAX_SIZE
        && fault_addr.as_usize() < PHYS_BASE
        && fault_addr.as_usize() >= esp.saturating_sub(STACK_SLOP)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(addr: usize, esp: usize) -> bool {
        let fault_addr = VirtualAddress::new(addr);
        stack_access(fault_addr, fault_addr.page_round_down(), esp)
    }

    #[test]
    fn test_push_below_esp_is_stack_access() {
        // PUSH faults 4 bytes below the stack pointer
        assert!(classify(0xBFFF_FFF8, 0xBFFF_FFFC));
    }

    #[test]
    fn test_pusha_window_boundary() {
        let esp = 0xBFFF_FFFC;
        assert!(classify(esp - 32, esp));
        assert!(!classify(esp - 33, esp));
    }

    #[test]
    fn test_access_above_esp_is_stack_access() {
        assert!(classify(0xBFFF_F000, 0xBFFF_0000));
    }

    #[test]
    fn test_wild_write_far_below_esp_is_rejected() {
        // 256 bytes below esp: outside the 32-byte window
        assert!(!classify(0xBFFF_FF00, 0xBFFF_FFFC));
    }

    #[test]
    fn test_stack_ceiling() {
        let esp = PHYS_BASE - STACK_MAX_SIZE - 8;
        // Inside the ceiling
        assert!(classify(PHYS_BASE - STACK_MAX_SIZE, esp));
        // One page below the ceiling
        assert!(!classify(PHYS_BASE - STACK_MAX_SIZE - 4, esp));
    }

    #[test]
    fn test_kernel_address_is_never_stack() {
        assert!(!classify(PHYS_BASE, PHYS_BASE + 16));
        assert!(!classify(PHYS_BASE + 0x1000, PHYS_BASE + 0x2000));
    }
}
