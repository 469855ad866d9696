//! Byte-budgeted LRU map with pinning
//!
//! Recency is a monotonically increasing tick. `order` maps tick → key so the
//! least recently used entry is always the first key of the BTreeMap.
//! Pinned entries keep their place in the order but are skipped by eviction.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

struct LruEntry<V> {
    value: V,
    size: u64,
    tick: u64,
    pinned: bool,
}

/// LRU map bounded by the sum of entry sizes
pub struct ByteLru<K, V> {
    entries: HashMap<K, LruEntry<V>>,
    order: BTreeMap<u64, K>,
    tick: u64,
    bytes: u64,
    capacity: u64,
}

impl<K, V> ByteLru<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            tick: 0,
            bytes: 0,
            capacity: capacity_bytes,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Look up `key` and mark it most recently used
    pub fn get(&mut self, key: &K) -> Option<V> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        self.order.insert(tick, key.clone());
        Some(entry.value.clone())
    }

    /// Look up `key` without touching recency
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or replace `key`, then evict least recently used unpinned
    /// entries until the budget holds. Returns the evicted keys.
    ///
    /// An unpinned value larger than the whole budget is not retained.
    pub fn insert(&mut self, key: K, value: V, size: u64, pinned: bool) -> Vec<K> {
        self.remove(&key);

        if !pinned && size > self.capacity {
            return Vec::new();
        }

        let tick = self.next_tick();
        self.order.insert(tick, key.clone());
        self.entries.insert(
            key,
            LruEntry {
                value,
                size,
                tick,
                pinned,
            },
        );
        self.bytes += size;

        self.evict_over_budget()
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        self.bytes -= entry.size;
        Some(entry.value)
    }

    /// Change the pinned flag of an existing entry. Unpinning may evict.
    pub fn set_pinned(&mut self, key: &K, pinned: bool) -> (bool, Vec<K>) {
        let Some(entry) = self.entries.get_mut(key) else {
            return (false, Vec::new());
        };
        entry.pinned = pinned;
        let evicted = if pinned {
            Vec::new()
        } else {
            self.evict_over_budget()
        };
        (true, evicted)
    }

    pub fn is_pinned(&self, key: &K) -> bool {
        self.entries.get(key).is_some_and(|entry| entry.pinned)
    }

    fn evict_over_budget(&mut self) -> Vec<K> {
        let mut evicted = Vec::new();
        if self.bytes <= self.capacity {
            return evicted;
        }

        let candidates: Vec<(u64, K)> = self
            .order
            .iter()
            .filter(|(_, key)| self.entries.get(*key).is_some_and(|entry| !entry.pinned))
            .map(|(tick, key)| (*tick, key.clone()))
            .collect();

        for (tick, key) in candidates {
            if self.bytes <= self.capacity {
                break;
            }
            self.order.remove(&tick);
            if let Some(entry) = self.entries.remove(&key) {
                self.bytes -= entry.size;
            }
            evicted.push(key);
        }
        evicted
    }

    /// Keys from least to most recently used
    pub fn keys_by_recency(&self) -> Vec<K> {
        self.order.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pinned_len(&self) -> usize {
        self.entries.values().filter(|entry| entry.pinned).count()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}
