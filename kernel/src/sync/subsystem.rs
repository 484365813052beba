//! Boot-installed subsystem singletons
//!
//! The user pool and the swap store can only be constructed at boot, once
//! the boot code knows which memory region and which block device they
//! own, and they are never re-initialized afterwards. `Subsystem` is the
//! cell such a singleton lives in: install exactly once, access by
//! closure, and any touch before boot has installed it panics with the
//! subsystem's name. Folding the missing-init check into the cell keeps
//! the call sites free of repeated expect strings.

use spin::Mutex;

/// A named, install-once home for a boot-constructed singleton.
pub struct Subsystem<T> {
    name: &'static str,
    slot: Mutex<Option<T>>,
}

impl<T> Subsystem<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Mutex::new(None),
        }
    }

    /// Install the value built at boot.
    ///
    /// # Panics
    /// Panics on a second install; subsystems are never re-initialized.
    pub fn install(&self, value: T) {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            panic!("{} installed twice", self.name);
        }
        *slot = Some(value);
    }

    /// Run `f` with exclusive access to the installed value.
    ///
    /// # Panics
    /// Panics if nothing has been installed: using a subsystem before
    /// boot wired it up is a kernel bug, reported by name.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        match self.slot.lock().as_mut() {
            Some(value) => f(value),
            None => panic!("{} used before boot installed it", self.name),
        }
    }

    /// Whether boot has installed the value yet.
    pub fn is_installed(&self) -> bool {
        self.slot.lock().is_some()
    }
}
