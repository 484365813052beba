//! Interrupt dispatch table
//!
//! The low-level entry stubs (external to this crate) funnel every vector
//! into [`dispatch`] with interrupts disabled and a register snapshot. The
//! table records, per vector, the handler, a human-readable mnemonic, the
//! descriptor privilege level the IDT descriptor is built with (DPL 3
//! vectors are invocable from user code via `int`), and whether the
//! handler runs with interrupts re-enabled.

use lazy_static::lazy_static;
use spin::Mutex;

use super::trap::InterruptFrame;

/// Number of interrupt vectors
pub const INTR_CNT: usize = 256;

/// Handler for one interrupt vector
pub type Handler = fn(&mut InterruptFrame);

/// Whether a handler runs with interrupts enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrLevel {
    On,
    Off,
}

/// Descriptor privilege level for a vector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// DPL 0: only reachable from kernel mode or as a CPU exception
    Kernel,
    /// DPL 3: user code may raise the vector explicitly (INT, INT3, ...)
    User,
}

#[derive(Clone, Copy)]
struct Entry {
    handler: Handler,
    name: &'static str,
    level: IntrLevel,
    dpl: Privilege,
}

lazy_static! {
    static ref TABLE: Mutex<[Option<Entry>; INTR_CNT]> = Mutex::new([None; INTR_CNT]);
}

/// Register a handler for an interrupt vector.
///
/// # Panics
/// Panics on double registration -- vectors are claimed once at boot.
pub fn register_int(
    vec_no: usize,
    dpl: Privilege,
    level: IntrLevel,
    handler: Handler,
    name: &'static str,
) {
    let mut table = TABLE.lock();
    assert!(vec_no < INTR_CNT);
    assert!(
        table[vec_no].is_none(),
        "vector {:#04x} registered twice",
        vec_no
    );
    table[vec_no] = Some(Entry {
        handler,
        name,
        level,
        dpl,
    });
}

/// Dispatch an interrupt to its registered handler.
///
/// Entered with interrupts disabled. Handlers registered `IntrLevel::On`
/// run with interrupts re-enabled; `IntrLevel::Off` handlers manage the
/// interrupt flag themselves (the page-fault handler re-enables once it
/// has read the fault-address register).
pub fn dispatch(frame: &mut InterruptFrame) {
    let entry = {
        let table = TABLE.lock();
        assert!(frame.vec_no < INTR_CNT);
        table[frame.vec_no]
    };

    match entry {
        Some(entry) => {
            if entry.level == IntrLevel::On {
                enable();
            }
            (entry.handler)(frame);
        }
        None => {
            frame.dump();
            panic!("Unexpected interrupt {:#04x}", frame.vec_no);
        }
    }
}

/// Mnemonic registered for a vector, e.g. `#PF Page-Fault Exception`.
pub fn name_of(vec_no: usize) -> &'static str {
    TABLE
        .lock()
        .get(vec_no)
        .and_then(|entry| entry.map(|e| e.name))
        .unwrap_or("unknown")
}

/// Descriptor privilege level registered for a vector.
pub fn privilege_of(vec_no: usize) -> Option<Privilege> {
    TABLE
        .lock()
        .get(vec_no)
        .and_then(|entry| entry.map(|e| e.dpl))
}

// ---------------------------------------------------------------------------
// Interrupt flag
// ---------------------------------------------------------------------------

/// Enable maskable interrupts.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn enable() {
    // SAFETY: sti only sets the interrupt flag; handlers registered in the
    // IDT are prepared to run at any point kernel code enables interrupts.
    unsafe {
        core::arch::asm!("sti");
    }
}

/// Disable maskable interrupts.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn disable() {
    // SAFETY: cli only clears the interrupt flag.
    unsafe {
        core::arch::asm!("cli");
    }
}

/// Whether maskable interrupts are enabled.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn are_enabled() -> bool {
    let eflags: usize;
    // SAFETY: pushfd/pop reads EFLAGS into a register without changing
    // any machine state besides the scratch slot on the stack.
    unsafe {
        core::arch::asm!("pushfd", "pop {}", out(reg) eflags);
    }
    eflags & (1 << 9) != 0
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod host {
    use core::sync::atomic::{AtomicBool, Ordering};

    static ENABLED: AtomicBool = AtomicBool::new(false);

    pub fn enable() {
        ENABLED.store(true, Ordering::Release);
    }

    pub fn disable() {
        ENABLED.store(false, Ordering::Release);
    }

    pub fn are_enabled() -> bool {
        ENABLED.load(Ordering::Acquire)
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub use host::*;

#[cfg(test)]
mod tests {
    use super::*;

    fn nop_handler(_frame: &mut InterruptFrame) {}

    #[test]
    fn test_register_and_name() {
        register_int(
            0xE0,
            Privilege::Kernel,
            IntrLevel::On,
            nop_handler,
            "#TT Test Exception",
        );
        assert_eq!(name_of(0xE0), "#TT Test Exception");
        assert_eq!(privilege_of(0xE0), Some(Privilege::Kernel));
        assert_eq!(name_of(0xE1), "unknown");
    }

    #[test]
    fn test_dispatch_enables_interrupts_for_on_level() {
        // The interrupt flag is shared with the scenario tests.
        let _guard = crate::integration_tests::env::lock();

        fn observe(_frame: &mut InterruptFrame) {
            assert!(are_enabled());
        }
        register_int(
            0xE2,
            Privilege::Kernel,
            IntrLevel::On,
            observe,
            "#TT Test Exception",
        );

        disable();
        let mut frame = InterruptFrame::new(0xE2);
        dispatch(&mut frame);
    }
}
