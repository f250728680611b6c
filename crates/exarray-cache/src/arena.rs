//! Arena of shared per-structure objects keyed by on-disk address.
//!
//! Handles on the same structure resolve to the same `Arc` through here, so
//! the cache (not a process-wide free list) decides whether an in-memory
//! header already exists for an address.

use crate::addr::Addr;
use crate::entry::SharedState;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

/// Address-keyed arena of shared objects.
pub struct SharedArena<T> {
    objects: DashMap<Addr, Arc<T>>,
}

impl<T: SharedState> SharedArena<T> {
    /// Create an empty arena
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
        }
    }

    /// Look up the object for `addr`
    pub fn get(&self, addr: Addr) -> Option<Arc<T>> {
        self.objects.get(&addr).map(|obj| Arc::clone(obj.value()))
    }

    /// Return the resident object for `addr`, or publish `candidate`.
    ///
    /// `acquire` runs under the arena's shard lock on whichever object wins,
    /// so it cannot race with [`release_if_idle`](Self::release_if_idle).
    /// A losing candidate is dropped without ever becoming visible.
    pub fn acquire_or_insert<E>(
        &self,
        addr: Addr,
        candidate: T,
        acquire: impl FnOnce(&T) -> Result<(), E>,
    ) -> Result<Arc<T>, E> {
        match self.objects.entry(addr) {
            Entry::Occupied(occupied) => {
                let existing = Arc::clone(occupied.get());
                acquire(&existing)?;
                Ok(existing)
            }
            Entry::Vacant(vacant) => {
                acquire(&candidate)?;
                let object = Arc::new(candidate);
                vacant.insert(Arc::clone(&object));
                Ok(object)
            }
        }
    }

    /// Acquire an already resident object.
    pub fn acquire_existing<E>(
        &self,
        addr: Addr,
        acquire: impl FnOnce(&T) -> Result<(), E>,
    ) -> Option<Result<Arc<T>, E>> {
        let object = self.objects.get(&addr)?;
        Some(acquire(object.value()).map(|()| Arc::clone(object.value())))
    }

    /// Drop the arena's reference if the object reports idle.
    pub fn release_if_idle(&self, addr: Addr) -> bool {
        self.objects
            .remove_if(&addr, |_, object| object.is_idle())
            .is_some()
    }

    /// Unconditionally drop the arena's reference.
    pub fn remove(&self, addr: Addr) -> Option<Arc<T>> {
        self.objects.remove(&addr).map(|(_, object)| object)
    }

    /// Number of tracked objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the arena is empty
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl<T: SharedState> Default for SharedArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counted {
        refs: AtomicUsize,
        tag: u32,
    }

    impl SharedState for Counted {
        fn is_idle(&self) -> bool {
            self.refs.load(Ordering::Acquire) == 0
        }
    }

    fn bump(obj: &Counted) -> Result<(), ()> {
        obj.refs.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    #[test]
    fn test_second_acquire_shares_first_object() {
        let arena = SharedArena::new();
        let first = arena
            .acquire_or_insert(Addr::new(8), Counted { tag: 1, ..Default::default() }, bump)
            .expect("insert");
        let second = arena
            .acquire_or_insert(Addr::new(8), Counted { tag: 2, ..Default::default() }, bump)
            .expect("share");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.tag, 1);
        assert_eq!(first.refs.load(Ordering::Acquire), 2);
    }

    #[test]
    fn test_release_only_when_idle() {
        let arena = SharedArena::new();
        let obj = arena
            .acquire_or_insert(Addr::new(8), Counted::default(), bump)
            .expect("insert");
        assert!(!arena.release_if_idle(Addr::new(8)));

        obj.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(arena.release_if_idle(Addr::new(8)));
        assert!(arena.is_empty());
    }

    #[test]
    fn test_failed_acquire_publishes_nothing() {
        let arena: SharedArena<Counted> = SharedArena::new();
        let result = arena.acquire_or_insert(Addr::new(8), Counted::default(), |_| Err("denied"));
        assert_eq!(result.err(), Some("denied"));
        assert!(arena.get(Addr::new(8)).is_none());
        assert!(arena.acquire_existing(Addr::new(8), bump).is_none());
    }
}
