//! Synchronization Primitives
//!
//! The install-once cell the boot-constructed singletons live in, and the
//! ownership-aware lock used by the frame table.

pub mod held_lock;
pub mod subsystem;

pub use held_lock::HeldLock;
pub use subsystem::Subsystem;
