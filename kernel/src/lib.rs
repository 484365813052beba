//! ObsidianOS Kernel Library -- user-process virtual memory core
//!
//! This library implements the demand-paged virtual memory subsystem of the
//! kernel: the supplemental page table that describes how every user page is
//! materialized, the frame table that owns physical user frames and evicts
//! under pressure, the swap store, and the page-fault handler that ties them
//! together.
//!
//! The bootable kernel binary, scheduler, system-call plumbing, file system
//! and device drivers are external collaborators; this crate exposes the
//! seams they plug into (`arch::x86::idt::dispatch`, the swap
//! [`BlockDevice`](mm::swap::BlockDevice) seam, the
//! [`BackingFile`](mm::demand_paging::BackingFile) seam, and the process
//! registry in [`process`]).

#![no_std]

extern crate alloc;

// Host target (x86_64-unknown-linux-gnu): re-link std so the standard
// #[test] harness and the system allocator are available for unit tests.
#[cfg(not(target_os = "none"))]
extern crate std;

pub mod arch;
pub mod error;
pub mod mm;
pub mod process;
pub mod sync;


// Re-export memory management for collaborators and tests
pub use error::{KernelError, KernelResult};
pub use mm::{FrameNumber, VirtualAddress, PAGE_SIZE, PHYS_BASE};
