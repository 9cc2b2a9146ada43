//! Live session registry.
//!
//! A concurrent map from [`SessionId`] to a shared session handle. Any loop
//! thread may insert, remove or look up at the same time; each operation only
//! holds one shard lock for the duration of the map access and never across
//! I/O or a user callback.
//!
//! Enumeration works on a snapshot: the `Arc`s are collected first and the
//! visitor runs with no lock held. A visitor may therefore send on, close, or
//! even remove the entry it is given.

use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};

use crate::session::{Session, SessionId};

/// Something that can be stored in a [`Registry`].
pub trait Registered: Send + Sync + 'static {
    /// Unique key of the entry.
    fn registry_id(&self) -> SessionId;
}

impl Registered for Session {
    fn registry_id(&self) -> SessionId {
        self.id()
    }
}

/// Registry of live sessions.
pub type SessionRegistry = Registry<Session>;

/// Concurrent set of shared entries keyed by [`SessionId`].
#[derive(Debug)]
pub struct Registry<T: Registered> {
    entries: DashMap<SessionId, Arc<T>>,
}

impl<T: Registered> Default for Registry<T> {
    fn default() -> Self {
        Self { entries: DashMap::new() }
    }
}

impl<T: Registered> Registry<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entry`.
    ///
    /// Returns `false` (and leaves the registry unchanged) if an entry with
    /// the same id is already present.
    pub fn insert(&self, entry: Arc<T>) -> bool {
        match self.entries.entry(entry.registry_id()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                true
            },
        }
    }

    /// Unregister the entry with `id`, returning it if it was present.
    pub fn remove(&self, id: SessionId) -> Option<Arc<T>> {
        self.entries.remove(&id).map(|(_, entry)| entry)
    }

    /// Entry with `id`. `None` if not registered.
    pub fn get(&self, id: SessionId) -> Option<Arc<T>> {
        self.entries.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Check if an entry is registered.
    pub fn contains(&self, id: SessionId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of registered entries.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Handles to every registered entry at this instant.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Visit every entry of a snapshot.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&Arc<T>),
    {
        for entry in self.snapshot() {
            visitor(&entry);
        }
    }

    /// First entry of a snapshot matching `predicate`.
    pub fn find_first<P>(&self, mut predicate: P) -> Option<Arc<T>>
    where
        P: FnMut(&Arc<T>) -> bool,
    {
        self.snapshot().into_iter().find(|entry| predicate(entry))
    }

    /// Remove every entry, returning what was registered.
    pub fn clear(&self) -> Vec<Arc<T>> {
        let ids: Vec<SessionId> = self.entries.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, thread};

    use proptest::prelude::*;

    use super::*;

    #[derive(Debug)]
    struct Member {
        id: SessionId,
        label: &'static str,
    }

    impl Registered for Member {
        fn registry_id(&self) -> SessionId {
            self.id
        }
    }

    fn entry(id: u64, label: &'static str) -> Arc<Member> {
        Arc::new(Member { id: SessionId::from_raw(id), label })
    }

    #[test]
    fn insert_and_lookup() {
        let registry = Registry::new();

        assert!(registry.insert(entry(1, "a")));
        assert!(registry.contains(SessionId::from_raw(1)));
        assert!(!registry.contains(SessionId::from_raw(2)));
        assert_eq!(registry.get(SessionId::from_raw(1)).unwrap().label, "a");
    }

    #[test]
    fn duplicate_insert_fails() {
        let registry = Registry::new();

        assert!(registry.insert(entry(1, "first")));
        assert!(!registry.insert(entry(1, "second")));
        assert_eq!(registry.get(SessionId::from_raw(1)).unwrap().label, "first");
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn remove_returns_entry() {
        let registry = Registry::new();
        registry.insert(entry(7, "seven"));

        let removed = registry.remove(SessionId::from_raw(7)).unwrap();
        assert_eq!(removed.label, "seven");
        assert!(registry.remove(SessionId::from_raw(7)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn find_first_matches_predicate() {
        let registry = Registry::new();
        registry.insert(entry(1, "a"));
        registry.insert(entry(2, "b"));

        let found = registry.find_first(|e| e.label == "b").unwrap();
        assert_eq!(found.registry_id(), SessionId::from_raw(2));
        assert!(registry.find_first(|e| e.label == "z").is_none());
    }

    #[test]
    fn visitor_may_remove_entries() {
        let registry = Registry::new();
        for id in 0..10 {
            registry.insert(entry(id, "x"));
        }

        let mut visited = 0;
        registry.for_each(|e| {
            visited += 1;
            registry.remove(e.registry_id());
        });

        assert_eq!(visited, 10);
        assert!(registry.is_empty());
    }

    #[test]
    fn clear_drains_everything() {
        let registry = Registry::new();
        registry.insert(entry(1, "a"));
        registry.insert(entry(2, "b"));

        let drained: HashSet<_> = registry.clear().iter().map(|e| e.registry_id()).collect();
        assert_eq!(drained.len(), 2);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn concurrent_insert_and_remove() {
        let registry = Arc::new(Registry::new());

        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for i in 0..250 {
                        let id = t * 1000 + i;
                        assert!(registry.insert(entry(id, "x")));
                        if i % 2 == 0 {
                            assert!(registry.remove(SessionId::from_raw(id)).is_some());
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.count(), 4 * 125);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Property: count always equals the number of ids inserted and not yet removed
        #[test]
        fn prop_count_matches_live_entries(ops in prop::collection::vec((any::<bool>(), 0u64..32), 0..200)) {
            let registry = Registry::new();
            let mut live = HashSet::new();

            for (insert, id) in ops {
                if insert {
                    prop_assert_eq!(registry.insert(entry(id, "x")), live.insert(id));
                } else {
                    prop_assert_eq!(registry.remove(SessionId::from_raw(id)).is_some(), live.remove(&id));
                }
                prop_assert_eq!(registry.count(), live.len());
            }

            let mut seen = HashSet::new();
            registry.for_each(|e| { seen.insert(e.registry_id().as_u64()); });
            prop_assert_eq!(seen, live);
        }
    }
}
