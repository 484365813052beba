//! Interrupt frames and segment selectors
//!
//! The register snapshot the low-level interrupt stubs push before calling
//! into [`idt::dispatch`](super::idt::dispatch). The code segment selector
//! in the frame tells the exception unit whether a fault came from user or
//! kernel code.

/// Null segment selector
pub const SEL_NULL: u16 = 0x00;
/// Kernel code segment selector
pub const SEL_KCSEG: u16 = 0x08;
/// Kernel data segment selector
pub const SEL_KDSEG: u16 = 0x10;
/// User code segment selector
pub const SEL_UCSEG: u16 = 0x1B;
/// User data segment selector
pub const SEL_UDSEG: u16 = 0x23;

/// Register snapshot at interrupt entry.
///
/// Layout mirrors what the entry stubs push: general registers, segment
/// registers, the vector and error code, then the CPU-pushed interrupt
/// context. `esp` and `ss` hold the interrupted user stack only when the
/// interrupt caused a user-to-kernel privilege switch.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct InterruptFrame {
    // Pushed by the entry stub (pushal order)
    pub edi: usize,
    pub esi: usize,
    pub ebp: usize,
    pub esp_dummy: usize,
    pub ebx: usize,
    pub edx: usize,
    pub ecx: usize,
    pub eax: usize,
    pub gs: u16,
    pub fs: u16,
    pub es: u16,
    pub ds: u16,
    /// Interrupt vector number
    pub vec_no: usize,
    /// Error code pushed by the CPU (0 for vectors without one)
    pub error_code: usize,
    // Pushed by the CPU
    pub eip: usize,
    pub cs: u16,
    pub eflags: usize,
    pub esp: usize,
    pub ss: u16,
}

impl InterruptFrame {
    /// A zeroed frame for a given vector, in kernel context.
    pub fn new(vec_no: usize) -> Self {
        Self {
            edi: 0,
            esi: 0,
            ebp: 0,
            esp_dummy: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            gs: SEL_KDSEG,
            fs: SEL_KDSEG,
            es: SEL_KDSEG,
            ds: SEL_KDSEG,
            vec_no,
            error_code: 0,
            eip: 0,
            cs: SEL_KCSEG,
            eflags: 0,
            esp: 0,
            ss: SEL_KDSEG,
        }
    }

    /// Whether the interrupted code was running in user mode.
    pub fn from_user(&self) -> bool {
        self.cs & 0x3 == 0x3
    }

    /// Log the register snapshot, the way the exception unit does before
    /// killing a process or panicking.
    pub fn dump(&self) {
        log::error!(
            "Interrupt {:#04x} ({}), error code {:#x}",
            self.vec_no,
            super::idt::name_of(self.vec_no),
            self.error_code
        );
        log::error!(
            " eip={:#010x} cs={:#06x} eflags={:#010x}",
            self.eip,
            self.cs,
            self.eflags
        );
        log::error!(
            " eax={:#010x} ebx={:#010x} ecx={:#010x} edx={:#010x}",
            self.eax,
            self.ebx,
            self.ecx,
            self.edx
        );
        log::error!(
            " esi={:#010x} edi={:#010x} ebp={:#010x} esp={:#010x} ss={:#06x}",
            self.esi,
            self.edi,
            self.ebp,
            self.esp,
            self.ss
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privilege_from_selector() {
        let mut frame = InterruptFrame::new(14);
        assert!(!frame.from_user());

        frame.cs = SEL_UCSEG;
        assert!(frame.from_user());
    }
}
