//! x86 Memory Management Unit support
//!
//! CR2 and TLB access for the paging code. On the bare-metal target these
//! touch the real control registers; on the host (where the library is
//! unit-tested) the fault address is an injectable cell and TLB operations
//! are no-ops.

use crate::mm::VirtualAddress;

/// Read the faulting virtual address from the last page fault.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn fault_address() -> VirtualAddress {
    let cr2: usize;
    // SAFETY: Reading CR2 returns the faulting virtual address from the
    // last page fault. Always accessible in kernel mode, no side effects.
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) cr2);
    }
    VirtualAddress::new(cr2)
}

/// Invalidate the TLB entry for a virtual address.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn flush_tlb_page(virt: VirtualAddress) {
    // SAFETY: invlpg invalidates the TLB entry for the given address. A
    // privileged, non-destructive operation that only affects caching.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) virt.as_usize());
    }
}

/// Flush the entire TLB by reloading CR3.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn flush_tlb() {
    // SAFETY: Reloading CR3 with its current value flushes all non-global
    // TLB entries without changing the active page table.
    unsafe {
        core::arch::asm!(
            "mov {tmp}, cr3",
            "mov cr3, {tmp}",
            tmp = out(reg) _,
        );
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod host {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use crate::mm::VirtualAddress;

    static FAULT_ADDRESS: AtomicUsize = AtomicUsize::new(0);

    /// Host stand-in for CR2.
    pub fn fault_address() -> VirtualAddress {
        VirtualAddress::new(FAULT_ADDRESS.load(Ordering::Acquire))
    }

    /// Inject a fault address before dispatching a synthesized page fault,
    /// the way the CPU loads CR2 before raising vector 14.
    pub fn set_fault_address(addr: VirtualAddress) {
        FAULT_ADDRESS.store(addr.as_usize(), Ordering::Release);
    }

    pub fn flush_tlb_page(_virt: VirtualAddress) {}

    pub fn flush_tlb() {}
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub use host::*;

/// Page fault error code bits (from the Intel SDM)
#[derive(Debug, Clone, Copy)]
pub struct PageFaultErrorCode(usize);

impl PageFaultErrorCode {
    /// Bit 0 (P): set on protection violation, clear on not-present
    pub const PRESENT: usize = 1 << 0;
    /// Bit 1 (W/R): set when the access was a write
    pub const WRITE: usize = 1 << 1;
    /// Bit 2 (U/S): set when the access came from user mode
    pub const USER: usize = 1 << 2;

    pub const fn new(code: usize) -> Self {
        Self(code)
    }

    /// Was the page simply not present (as opposed to a rights violation)?
    pub const fn not_present(&self) -> bool {
        self.0 & Self::PRESENT == 0
    }

    /// Was the access a write?
    pub const fn write(&self) -> bool {
        self.0 & Self::WRITE != 0
    }

    /// Was the access made in user mode?
    pub const fn user_mode(&self) -> bool {
        self.0 & Self::USER != 0
    }
}
