//! Architecture-specific support
//!
//! The VM core targets 32-bit x86; everything the machine-independent code
//! needs from the CPU (trap frames, the fault-address register, TLB
//! control, the interrupt dispatch table) lives under [`x86`].

pub mod x86;
