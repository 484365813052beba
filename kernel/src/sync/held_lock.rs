//! Ownership-aware spin lock
//!
//! The per-frame lock must be acquirable in one function and released in
//! another (a frame returned by `frame_table::alloc` stays locked until the
//! page contents have been installed), and the clock sweep must be able to
//! ask "does the *current* executor already hold this lock?" so it never
//! selects a frame it is itself operating on. A scoped `spin::Mutex` guard
//! cannot express either, so the holder's identity is recorded explicitly.

use core::sync::atomic::{AtomicU64, Ordering};

/// Executor id meaning "nobody holds the lock". Real executor ids are
/// process ids, which start at 1.
const FREE: u64 = 0;

/// A spin lock that records which executor holds it.
pub struct HeldLock {
    holder: AtomicU64,
}

impl HeldLock {
    pub const fn new() -> Self {
        Self {
            holder: AtomicU64::new(FREE),
        }
    }

    /// Acquire the lock for `executor`, spinning until it is free.
    ///
    /// # Panics
    /// Panics if `executor` already holds the lock: on a single CPU a
    /// recursive acquire would spin forever, so it is reported as the bug
    /// it is.
    pub fn acquire(&self, executor: u64) {
        debug_assert_ne!(executor, FREE);
        loop {
            match self
                .holder
                .compare_exchange_weak(FREE, executor, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => {
                    if current == executor {
                        panic!("recursive frame lock acquire by executor {}", executor);
                    }
                    core::hint::spin_loop();
                }
            }
        }
    }

    /// Try to acquire the lock for `executor` without blocking.
    ///
    /// Returns `false` if the lock is held by anyone, *including
    /// `executor` itself* -- the clock sweep relies on that to skip frames
    /// the current executor has in flux for its own pending operation.
    pub fn try_acquire(&self, executor: u64) -> bool {
        debug_assert_ne!(executor, FREE);
        self.holder
            .compare_exchange(FREE, executor, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the lock.
    ///
    /// # Panics
    /// Panics if `executor` does not hold the lock.
    pub fn release(&self, executor: u64) {
        let prev = self
            .holder
            .compare_exchange(executor, FREE, Ordering::Release, Ordering::Relaxed);
        if prev.is_err() {
            panic!(
                "executor {} released a frame lock held by {}",
                executor,
                prev.unwrap_err()
            );
        }
    }

    /// Whether `executor` currently holds the lock.
    pub fn is_held_by(&self, executor: u64) -> bool {
        self.holder.load(Ordering::Relaxed) == executor
    }

    /// Whether anyone currently holds the lock.
    pub fn is_held(&self) -> bool {
        self.holder.load(Ordering::Relaxed) != FREE
    }
}

impl Default for HeldLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release() {
        let lock = HeldLock::new();
        assert!(!lock.is_held());

        lock.acquire(1);
        assert!(lock.is_held());
        assert!(lock.is_held_by(1));
        assert!(!lock.is_held_by(2));

        lock.release(1);
        assert!(!lock.is_held());
    }

    #[test]
    fn test_try_acquire_held_by_other() {
        let lock = HeldLock::new();
        lock.acquire(1);
        assert!(!lock.try_acquire(2));
        lock.release(1);
        assert!(lock.try_acquire(2));
        lock.release(2);
    }

    #[test]
    fn test_try_acquire_held_by_self_is_refused() {
        let lock = HeldLock::new();
        lock.acquire(7);
        // The holder itself must be refused, not granted recursively.
        assert!(!lock.try_acquire(7));
        assert!(lock.is_held_by(7));
        lock.release(7);
    }

    #[test]
    #[should_panic(expected = "released a frame lock")]
    fn test_release_by_non_holder_panics() {
        let lock = HeldLock::new();
        lock.acquire(1);
        lock.release(2);
    }
}
