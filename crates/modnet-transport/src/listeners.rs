//! Copy-on-write listener sets.

use parking_lot::RwLock;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// A set of subscribers that can be changed while it is being notified.
///
/// Mutation swaps in a new list; dispatch clones the current `Arc` and
/// iterates it without holding the lock. A listener added during a dispatch
/// is not part of that round.
pub struct ListenerSet<L: ?Sized> {
    current: RwLock<Arc<Vec<Arc<L>>>>,
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self {
            current: RwLock::new(Arc::new(Vec::new())),
        }
    }
}

impl<L: ?Sized> ListenerSet<L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener. Returns `false` if it was already present.
    pub fn add(&self, listener: Arc<L>) -> bool {
        let mut current = self.current.write();
        if current.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(listener);
        *current = Arc::new(next);
        true
    }

    /// Remove a listener. Returns `false` if it was not present.
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut current = self.current.write();
        if !current.iter().any(|l| Arc::ptr_eq(l, listener)) {
            return false;
        }
        let next: Vec<_> = current
            .iter()
            .filter(|l| !Arc::ptr_eq(l, listener))
            .cloned()
            .collect();
        *current = Arc::new(next);
        true
    }

    pub fn clear(&self) {
        *self.current.write() = Arc::new(Vec::new());
    }

    /// The listeners as of now.
    pub fn snapshot(&self) -> Arc<Vec<Arc<L>>> {
        self.current.read().clone()
    }

    /// Call `f` for every listener in one consistent snapshot.
    ///
    /// A listener that panics is logged and skipped; the others still run.
    pub fn notify(&self, mut f: impl FnMut(&L)) {
        let snapshot = self.snapshot();
        for listener in snapshot.iter() {
            if panic::catch_unwind(AssertUnwindSafe(|| f(listener))).is_err() {
                tracing::error!("listener panicked");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
