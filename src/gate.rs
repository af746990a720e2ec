//! Versioned reclamation gate.
//!
//! A minimal single-writer/many-reader facility: holds one *version* of some
//! `T`, lets readers acquire a reference-counted snapshot that cannot be
//! freed for the duration of their hold, and retires the previous version
//! the moment a new one is installed over it. The acquire/install race this
//! implies — load a pointer, then safely bump its refcount with no window
//! where the pointee has already finished being destroyed — is exactly what
//! `arc-swap` exists to close, so the gate delegates to it rather than
//! reimplementing a hazard scheme from scratch.

use std::sync::Arc;

use arc_swap::ArcSwapOption;

/// Holds the current version of a `T`, if any has been installed yet.
pub struct Gate<T> {
    current: ArcSwapOption<T>,
}

impl<T> Gate<T> {
    /// A gate with nothing installed. `acquire()` returns `None` until the
    /// first `install()`.
    pub fn new_empty() -> Self {
        Self {
            current: ArcSwapOption::from(None),
        }
    }

    /// Atomically replace the current version with `v`. Whatever was
    /// previously installed is retired: its destructor runs once the last
    /// outstanding snapshot referencing it (from a prior `acquire()`) is
    /// dropped.
    pub fn install(&self, v: Arc<T>) {
        self.current.store(Some(v));
    }

    /// Atomically obtain a reference-counted snapshot of whatever is
    /// currently installed.
    ///
    /// `release` is not a separate operation here: dropping the returned
    /// `Arc` decrements the refcount, and the destructor runs automatically
    /// when it reaches zero.
    pub fn acquire(&self) -> Option<Arc<T>> {
        self.current.load_full()
    }
}
