//! The current scope label and the live-allocation table.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use once_cell::sync::Lazy;

use crate::ERR_POISONED_LOCK;

// The scope is process-wide by design: the intended use is annotating a
// phase of the program, not a thread.  Writers swap in a fresh immutable
// string; readers clone the Arc, so a concurrent allocation sees either
// the old or the new label, never a torn one.
static SCOPE: Lazy<RwLock<Arc<str>>> = Lazy::new(|| RwLock::new(Arc::from("")));

pub(crate) fn current_scope() -> Arc<str> {
    Arc::clone(&SCOPE.read().expect(ERR_POISONED_LOCK))
}

pub(crate) fn replace_scope(label: &str) {
    *SCOPE.write().expect(ERR_POISONED_LOCK) = Arc::from(label);
}

#[derive(Default)]
struct Maps {
    by_addr: HashMap<usize, (Arc<str>, usize)>,
    by_scope: HashMap<Arc<str>, usize>,
}

/// Live allocations keyed by address, plus per-scope live totals.  Both
/// maps mutate under one mutex; the lock covers map operations only, never
/// I/O or a call into the real allocator.
pub(crate) struct AllocationTable {
    maps: Mutex<Maps>,
}

impl AllocationTable {
    pub(crate) fn new() -> AllocationTable {
        AllocationTable {
            maps: Mutex::new(Maps::default()),
        }
    }

    /// Record a live allocation of `size` bytes at `addr`, attributed to
    /// `scope`.  Returns false when `addr` is already present; both maps
    /// are then left untouched and the caller reports the duplicate.
    pub(crate) fn add(&self, addr: usize, scope: Arc<str>, size: usize) -> bool {
        let mut maps = self.maps.lock().expect(ERR_POISONED_LOCK);
        let Maps { by_addr, by_scope } = &mut *maps;
        match by_addr.entry(addr) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                *by_scope.entry(Arc::clone(&scope)).or_insert(0) += size;
                slot.insert((scope, size));
                true
            }
        }
    }

    /// Remove the record for `addr` and subtract its size from the owning
    /// scope, clamping at zero.  The scope key stays in the map so its
    /// time-series line remains continuous.  Unknown addresses (bootstrap
    /// memory, pre-init allocations) are ignored.
    pub(crate) fn remove(&self, addr: usize) {
        let mut maps = self.maps.lock().expect(ERR_POISONED_LOCK);
        let Maps { by_addr, by_scope } = &mut *maps;
        let Some((scope, size)) = by_addr.remove(&addr) else {
            return;
        };
        if let Some(total) = by_scope.get_mut(&scope) {
            *total = total.saturating_sub(size);
        }
    }

    /// Make sure `scope` has an entry in the totals, starting at zero.
    /// Called when a scope label is set, so its time-series line exists
    /// from the moment of declaration even if it never allocates.
    pub(crate) fn declare_scope(&self, scope: Arc<str>) {
        let mut maps = self.maps.lock().expect(ERR_POISONED_LOCK);
        maps.by_scope.entry(scope).or_insert(0);
    }

    /// Copy of the per-scope totals.  This is the sampler's only read path.
    pub(crate) fn extents(&self) -> HashMap<Arc<str>, usize> {
        self.maps.lock().expect(ERR_POISONED_LOCK).by_scope.clone()
    }

    pub(crate) fn clear(&self) {
        let mut maps = self.maps.lock().expect(ERR_POISONED_LOCK);
        maps.by_addr.clear();
        maps.by_scope.clear();
    }

    #[cfg(test)]
    fn contains_addr(&self, addr: usize) -> bool {
        self.maps
            .lock()
            .expect(ERR_POISONED_LOCK)
            .by_addr
            .contains_key(&addr)
    }

    #[cfg(test)]
    fn force_scope_total(&self, scope: &str, total: usize) {
        self.maps
            .lock()
            .expect(ERR_POISONED_LOCK)
            .by_scope
            .insert(Arc::from(scope), total);
    }
}
