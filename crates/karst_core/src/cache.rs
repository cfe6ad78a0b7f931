//! A bounded cache with least-recently-used eviction.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// A bounded map that evicts the least recently used entry when full.
/// A limit of zero means unbounded. A disabled cache drops every
/// insert, so lookups always miss.
#[derive(Debug)]
pub(crate) struct LruCache<K, V> {
    entries: HashMap<K, V>,
    // Recency order, most recent at the back.
    order: VecDeque<K>,
    limit: usize,
    enabled: bool,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            limit,
            enabled: true,
        }
    }

    pub(crate) fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(0)
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Looks up `key`, marking it most recently used on a hit.
    pub(crate) fn get(&mut self, key: &K) -> Option<&V> {
        if self.entries.contains_key(key) {
            self.touch(key);
        }
        self.entries.get(key)
    }

    /// Inserts or replaces the entry for `key`.
    pub(crate) fn insert(&mut self, key: K, value: V) {
        if !self.enabled {
            return;
        }
        if self.entries.insert(key.clone(), value).is_some() {
            self.touch(&key);
            return;
        }
        self.order.push_back(key);
        while self.limit != 0 && self.entries.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    pub(crate) fn remove(&mut self, key: &K) {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Keeps only the entries whose key satisfies the predicate.
    pub(crate) fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) {
        self.entries.retain(|k, _| keep(k));
        let entries = &self.entries;
        self.order.retain(|k| entries.contains_key(k));
    }

    fn touch(&mut self, key: &K) {
        if let Some(position) = self.order.iter().position(|k| k == key) {
            self.order.remove(position);
            self.order.push_back(key.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_cache(limit: usize) -> LruCache<String, u32> {
        LruCache::new(limit)
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = create_cache(2);
        cache.insert("a".to_string(), 1);
        cache.insert("b".to_string(), 2);
        cache.insert("c".to_string(), 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a".to_string()), None);
        assert_eq!(cache.get(&"b".to_string()), Some(&2));
        assert_eq!(cache.get(&"c".to_string()), Some(&3));
    }

    #[test]
    fn get_refreshes_recency() {
        let mut cache = create_cache(2);
        cache.insert("a".to_string(), 1);
        cache.insert("b".to_string(), 2);
        cache.get(&"a".to_string());
        cache.insert("c".to_string(), 3);

        // "b" was the stalest entry once "a" was touched
        assert_eq!(cache.get(&"b".to_string()), None);
        assert_eq!(cache.get(&"a".to_string()), Some(&1));
    }

    #[test]
    fn zero_limit_is_unbounded() {
        let mut cache = create_cache(0);
        for n in 0..1000 {
            cache.insert(format!("k{n}"), n);
        }
        assert_eq!(cache.len(), 1000);
        assert_eq!(cache.get(&"k0".to_string()), Some(&0));
    }

    #[test]
    fn disabled_cache_always_misses() {
        let mut cache: LruCache<String, u32> = LruCache::disabled();
        cache.insert("a".to_string(), 1);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.get(&"a".to_string()), None);
    }

    #[test]
    fn reinsert_replaces_value() {
        let mut cache = create_cache(2);
        cache.insert("a".to_string(), 1);
        cache.insert("a".to_string(), 9);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(&9));
    }

    #[test]
    fn retain_drops_entries_and_order() {
        let mut cache = create_cache(4);
        cache.insert("a1".to_string(), 1);
        cache.insert("b1".to_string(), 2);
        cache.insert("a2".to_string(), 3);
        cache.retain(|k| k.starts_with('a'));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"b1".to_string()), None);
        cache.insert("c1".to_string(), 4);
        cache.insert("c2".to_string(), 5);
        // Eviction still works after retain
        assert_eq!(cache.len(), 4);
    }
}
