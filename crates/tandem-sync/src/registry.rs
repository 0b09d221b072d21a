//! Keyed table of live entities.
//!
//! Registration is first-wins: a second `register` for a key already present
//! is dropped, so replayed spawn packets cannot replace a live entity.

use std::hash::Hash;

use rustc_hash::FxHashMap;

/// A value that owns an external resource.
pub trait Destroy {
    /// Release the resource.
    fn destroy(&mut self);
}

/// Lookup table from key to live instance.
#[derive(Debug)]
pub struct EntityRegistry<K, T> {
    entries: FxHashMap<K, T>,
}

impl<K, T> Default for EntityRegistry<K, T> {
    fn default() -> Self {
        Self {
            entries: FxHashMap::default(),
        }
    }
}

impl<K: Eq + Hash + Copy, T> EntityRegistry<K, T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `entity` under `key` unless the key is taken. Returns whether
    /// it was inserted; a rejected entity is dropped.
    pub fn register(&mut self, key: K, entity: T) -> bool {
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, entity);
        true
    }

    /// Remove and return the entity under `key`.
    pub fn unregister(&mut self, key: K) -> Option<T> {
        self.entries.remove(&key)
    }

    /// Entity under `key`.
    pub fn get(&self, key: K) -> Option<&T> {
        self.entries.get(&key)
    }

    /// Entity under `key`, mutably.
    pub fn get_mut(&mut self, key: K) -> Option<&mut T> {
        self.entries.get_mut(&key)
    }

    /// Whether `key` is registered.
    pub fn contains(&self, key: K) -> bool {
        self.entries.contains_key(&key)
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered keys.
    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.entries.keys().copied()
    }

    /// All entries.
    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    /// All entries, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut T)> {
        self.entries.iter_mut().map(|(k, v)| (*k, v))
    }

    /// Remove every entity matching `pred`, returning them.
    pub fn drain_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<(K, T)> {
        let keys: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, v)| pred(v))
            .map(|(k, _)| *k)
            .collect();
        keys.into_iter()
            .filter_map(|k| self.entries.remove(&k).map(|v| (k, v)))
            .collect()
    }
}

impl<K: Eq + Hash + Copy, T: Destroy> EntityRegistry<K, T> {
    /// Destroy every entity, then empty the table.
    pub fn clear(&mut self) {
        for entity in self.entries.values_mut() {
            entity.destroy();
        }
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Tracked {
        name: &'static str,
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl Destroy for Tracked {
        fn destroy(&mut self) {
            self.log.borrow_mut().push(self.name);
        }
    }

    #[test]
    fn test_first_registration_wins() {
        let mut reg = EntityRegistry::new();
        assert!(reg.register(1u64, "first"));
        assert!(!reg.register(1u64, "second"));
        assert_eq!(reg.get(1), Some(&"first"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_get_miss_is_none() {
        let reg: EntityRegistry<u64, ()> = EntityRegistry::new();
        assert!(reg.get(42).is_none());
    }

    #[test]
    fn test_unregister_returns_entity() {
        let mut reg = EntityRegistry::new();
        reg.register(7u64, 'x');
        assert_eq!(reg.unregister(7), Some('x'));
        assert!(!reg.contains(7));
        assert_eq!(reg.unregister(7), None);
    }

    #[test]
    fn test_clear_destroys_everything() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut reg = EntityRegistry::new();
        for (key, name) in [(1u64, "a"), (2, "b")] {
            reg.register(
                key,
                Tracked {
                    name,
                    log: Rc::clone(&log),
                },
            );
        }
        reg.clear();
        assert!(reg.is_empty());
        let mut destroyed = log.borrow().clone();
        destroyed.sort_unstable();
        assert_eq!(destroyed, vec!["a", "b"]);
    }

    #[test]
    fn test_drain_where() {
        let mut reg = EntityRegistry::new();
        for k in 0u64..6 {
            reg.register(k, k % 2);
        }
        let mut odd: Vec<u64> = reg.drain_where(|v| *v == 1).into_iter().map(|(k, _)| k).collect();
        odd.sort_unstable();
        assert_eq!(odd, vec![1, 3, 5]);
        assert_eq!(reg.len(), 3);
    }
}
