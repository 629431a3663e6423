//! Per-thread guard against the tracker re-entering itself.
//!
//! Every tracker path that can allocate (map inserts, snapshot copies,
//! trace and log writes) runs with the guard held.  An allocation arriving
//! while the current thread already holds the guard is bookkeeping traffic
//! and must go straight to the real allocator, untracked.

use std::cell::Cell;

thread_local! {
    // True while the current thread is inside tracker bookkeeping.
    static IN_TRACKER: Cell<bool> = const { Cell::new(false) };
}

/// RAII handle marking the current thread as inside the tracker.
///
/// The flag is released on drop only if this frame set it, so nested
/// guards leave the outer frame's claim intact.
pub(crate) struct RecursionGuard {
    reentered: bool,
}

impl RecursionGuard {
    pub(crate) fn enter() -> Self {
        // A failed TLS access means the thread is being torn down; treat it
        // like reentry so the caller skips tracking and just forwards.
        let reentered = IN_TRACKER
            .try_with(|flag| flag.replace(true))
            .unwrap_or(true);
        RecursionGuard { reentered }
    }

    /// True when the guard was already held by this thread, i.e. the
    /// current call is a nested allocation caused by the tracker.
    pub(crate) fn reentered(&self) -> bool {
        self.reentered
    }

    /// Permanently mark the calling thread as inside the tracker.  The
    /// sampler uses this for its whole lifetime: its string formatting,
    /// gzip buffers and snapshot copies must never feed back into the
    /// table.
    pub(crate) fn pin_current_thread() {
        let _ = IN_TRACKER.try_with(|flag| flag.set(true));
    }
}

impl Drop for RecursionGuard {
    fn drop(&mut self) {
        if !self.reentered {
            let _ = IN_TRACKER.try_with(|flag| flag.set(false));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RecursionGuard;

    #[test]
    fn first_entry_is_not_reentrant() {
        let outer = RecursionGuard::enter();
        assert!(!outer.reentered());
    }

    #[test]
    fn nested_entry_is_reentrant() {
        let outer = RecursionGuard::enter();
        assert!(!outer.reentered());
        {
            let inner = RecursionGuard::enter();
            assert!(inner.reentered());
        }
        // Dropping the nested guard must not release the outer claim.
        let inner = RecursionGuard::enter();
        assert!(inner.reentered());
        drop(inner);
        drop(outer);
        let fresh = RecursionGuard::enter();
        assert!(!fresh.reentered());
    }

    #[test]
    fn guard_is_per_thread() {
        let _outer = RecursionGuard::enter();
        std::thread::spawn(|| {
            let other = RecursionGuard::enter();
            assert!(!other.reentered());
        })
        .join()
        .unwrap();
    }
}
