//! Bounded LRU cache with deterministic eviction.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// A strict-capacity LRU cache.
///
/// Eviction is deterministic: the least recently touched entry goes first.
/// Used for path-to-id resolution; the owner clears the cache whenever the
/// tree mutates structurally.
pub struct LruCache<K, V> {
    capacity: usize,
    tick: u64,
    map: HashMap<K, (V, u64)>,
    order: BTreeMap<u64, K>,
}

impl<K: Clone + Eq + Hash, V: Clone> LruCache<K, V> {
    /// Creates a cache holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            map: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Looks up a key, marking it most recently used.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let tick = self.next_tick();
        let (value, old_tick) = self.map.get_mut(key)?;
        self.order.remove(&*old_tick);
        *old_tick = tick;
        let value = value.clone();
        self.order.insert(tick, key.clone());
        Some(value)
    }

    /// Inserts or replaces an entry, evicting the oldest if over capacity.
    pub fn insert(&mut self, key: K, value: V) {
        let tick = self.next_tick();
        if let Some((_, old_tick)) = self.map.insert(key.clone(), (value, tick)) {
            self.order.remove(&old_tick);
        }
        self.order.insert(tick, key);

        while self.map.len() > self.capacity {
            if let Some((&oldest, _)) = self.order.iter().next() {
                if let Some(key) = self.order.remove(&oldest) {
                    self.map.remove(&key);
                }
            }
        }
    }

    /// Removes a single entry.
    pub fn remove(&mut self, key: &K) {
        if let Some((_, tick)) = self.map.remove(key) {
            self.order.remove(&tick);
        }
    }

    /// Drops all entries.
    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true when empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = LruCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        // Touch "a" so "b" becomes the eviction candidate.
        assert_eq!(cache.get(&"a"), Some(1));
        cache.insert("c", 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn replace_does_not_grow() {
        let mut cache = LruCache::new(2);
        cache.insert("a", 1);
        cache.insert("a", 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"a"), Some(2));
    }

    #[test]
    fn remove_and_clear() {
        let mut cache = LruCache::new(4);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.remove(&"a");
        assert_eq!(cache.get(&"a"), None);
        cache.clear();
        assert!(cache.is_empty());
    }
}
