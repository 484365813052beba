//! CPU exception handling
//!
//! Registers handlers for the exceptions user programs can cause. Most of
//! them simply kill the offending process -- there is no signal delivery --
//! but page faults (vector 14) are routed into the virtual memory core,
//! which services lazy loads, stack growth and swap-ins, and only kills
//! the process when the access is genuinely bad.

use super::idt::{self, IntrLevel, Privilege};
use super::mmu::{self, PageFaultErrorCode};
use super::trap::{InterruptFrame, SEL_KCSEG, SEL_UCSEG};
use crate::mm::page_fault::{self, FaultOutcome, PageFaultInfo, SYS_BAD_ADDR};
use crate::process;

/// Register handlers for the exception vectors.
///
/// Vectors 3, 4 and 5 can be raised explicitly by user programs (via INT3,
/// INTO and BOUND), so their descriptors get DPL 3. The rest get DPL 0 and
/// can only be caused indirectly (e.g. #DE by dividing by zero).
///
/// Page faults need interrupts off until the fault address has been read
/// from CR2; every other handler runs with interrupts on.
pub fn init() {
    idt::register_int(3, Privilege::User, IntrLevel::On, kill, "#BP Breakpoint Exception");
    idt::register_int(4, Privilege::User, IntrLevel::On, kill, "#OF Overflow Exception");
    idt::register_int(
        5,
        Privilege::User,
        IntrLevel::On,
        kill,
        "#BR BOUND Range Exceeded Exception",
    );

    idt::register_int(0, Privilege::Kernel, IntrLevel::On, kill, "#DE Divide Error");
    idt::register_int(1, Privilege::Kernel, IntrLevel::On, kill, "#DB Debug Exception");
    idt::register_int(
        6,
        Privilege::Kernel,
        IntrLevel::On,
        kill,
        "#UD Invalid Opcode Exception",
    );
    idt::register_int(
        7,
        Privilege::Kernel,
        IntrLevel::On,
        kill,
        "#NM Device Not Available Exception",
    );
    idt::register_int(11, Privilege::Kernel, IntrLevel::On, kill, "#NP Segment Not Present");
    idt::register_int(
        12,
        Privilege::Kernel,
        IntrLevel::On,
        kill,
        "#SS Stack Fault Exception",
    );
    idt::register_int(
        13,
        Privilege::Kernel,
        IntrLevel::On,
        kill,
        "#GP General Protection Exception",
    );
    idt::register_int(
        16,
        Privilege::Kernel,
        IntrLevel::On,
        kill,
        "#MF x87 FPU Floating-Point Error",
    );
    idt::register_int(
        19,
        Privilege::Kernel,
        IntrLevel::On,
        kill,
        "#XF SIMD Floating-Point Exception",
    );

    idt::register_int(
        14,
        Privilege::Kernel,
        IntrLevel::Off,
        page_fault,
        "#PF Page-Fault Exception",
    );
}

/// Log exception statistics.
pub fn print_stats() {
    log::info!("Exception: {} page faults", page_fault::fault_count());
}

/// Handler for an exception (probably) caused by a user process.
///
/// The code segment selector in the frame tells us where the exception
/// originated: user-segment faults kill the user process, kernel-segment
/// faults are kernel bugs and panic, anything else kills the process.
fn kill(frame: &mut InterruptFrame) {
    match frame.cs {
        SEL_UCSEG => {
            log::error!(
                "{}: dying due to interrupt {:#04x} ({}).",
                process::current_name(),
                frame.vec_no,
                idt::name_of(frame.vec_no)
            );
            frame.dump();
            process::exit_current(-1);
        }
        SEL_KCSEG => {
            frame.dump();
            panic!("Kernel bug - unexpected interrupt in kernel");
        }
        _ => {
            log::error!(
                "Interrupt {:#04x} ({}) in unknown segment {:#06x}",
                frame.vec_no,
                idt::name_of(frame.vec_no),
                frame.cs
            );
            process::exit_current(-1);
        }
    }
}

/// Page fault handler, vector 14.
///
/// Entered with interrupts off so CR2 can be read before another fault
/// overwrites it. The machine-independent service decides the outcome;
/// this entry applies it to the trap frame:
///
/// - `Resolved`: the page is resident now; returning retries the
///   faulting instruction.
/// - `ReturnBadAddr`: a kernel-mode access to a bad user address. The
///   user-pointer probe routines stash their recovery address in `eax`
///   before touching user memory, so moving `eax` into `eip` and storing
///   the all-ones sentinel in `eax` makes the probe return failure
///   instead of panicking the kernel.
/// - `Kill`: an unservicable user access; print the diagnostic and kill.
fn page_fault(frame: &mut InterruptFrame) {
    let fault_addr = mmu::fault_address();

    // CR2 is captured; taking interrupts is safe again.
    idt::enable();

    let code = PageFaultErrorCode::new(frame.error_code);
    let info = PageFaultInfo {
        fault_addr,
        not_present: code.not_present(),
        write: code.write(),
        user: code.user_mode(),
        esp: frame.esp,
    };

    match page_fault::handle_page_fault(&info) {
        FaultOutcome::Resolved => {}
        FaultOutcome::ReturnBadAddr => {
            frame.eip = frame.eax;
            frame.eax = SYS_BAD_ADDR;
        }
        FaultOutcome::Kill => {
            log::error!(
                "Page fault at {}: {} error {} page in {} context.",
                fault_addr,
                if info.not_present { "not present" } else { "rights violation" },
                if info.write { "writing" } else { "reading" },
                if info.user { "user" } else { "kernel" }
            );
            kill(frame);
        }
    }
}
