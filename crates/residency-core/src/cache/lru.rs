//! Byte-bounded LRU tier.
//!
//! The building block of both cache tiers and the lifecycle warm set. Recency
//! is tracked with a monotonically increasing tick, so ties in wall-clock
//! `last_access` are broken by insertion/access order (oldest first). The tier
//! never evicts on its own: callers pop victims explicitly so that what
//! happens to a victim (demotion, teardown, deletion) stays with them.

use super::types::CacheEntry;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug)]
pub struct LruTier<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// tick → key, oldest first.
    order: BTreeMap<u64, String>,
    next_tick: u64,
    current_bytes: u64,
    budget_bytes: u64,
    max_entries: Option<usize>,
}

impl<V> LruTier<V> {
    /// Create a tier bounded by bytes and, optionally, by entry count.
    pub fn new(budget_bytes: u64, max_entries: Option<usize>) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
            current_bytes: 0,
            budget_bytes,
            max_entries,
        }
    }

    fn tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn current_bytes(&self) -> u64 {
        self.current_bytes
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    pub fn set_budget_bytes(&mut self, budget_bytes: u64) {
        self.budget_bytes = budget_bytes;
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Whether an entry of `size` fits next to `reserved` extra bytes without
    /// evicting anything.
    pub fn fits(&self, size: u64, reserved: u64) -> bool {
        let bytes_ok = self
            .current_bytes
            .saturating_add(reserved)
            .saturating_add(size)
            <= self.budget_bytes;
        let count_ok = self
            .max_entries
            .map(|max| self.entries.len() < max)
            .unwrap_or(true);
        bytes_ok && count_ok
    }

    /// Look up an entry and mark it most recently used.
    pub fn touch(&mut self, key: &str) -> Option<&CacheEntry<V>> {
        let tick = self.tick();
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        entry.access_count += 1;
        entry.last_access = Utc::now();
        self.order.insert(tick, key.to_string());
        Some(&*entry)
    }

    /// Look up an entry without changing its recency.
    pub fn peek(&self, key: &str) -> Option<&CacheEntry<V>> {
        self.entries.get(key)
    }

    pub fn peek_mut(&mut self, key: &str) -> Option<&mut CacheEntry<V>> {
        self.entries.get_mut(key)
    }

    /// Insert as most recently used, returning any entry it replaced.
    ///
    /// Does not evict; check [`LruTier::fits`] and pop victims first.
    pub fn insert(&mut self, key: String, value: V, size_bytes: u64) -> Option<CacheEntry<V>> {
        let now = Utc::now();
        self.insert_with_times(key, value, size_bytes, now, now, 0)
    }

    /// Insert with explicit timestamps, used when rebuilding from a persisted
    /// index. Insert in ascending `last_access` order to preserve recency.
    pub fn insert_with_times(
        &mut self,
        key: String,
        value: V,
        size_bytes: u64,
        created_at: DateTime<Utc>,
        last_access: DateTime<Utc>,
        access_count: u64,
    ) -> Option<CacheEntry<V>> {
        let previous = self.remove(&key);
        let tick = self.tick();
        self.order.insert(tick, key.clone());
        self.current_bytes = self.current_bytes.saturating_add(size_bytes);
        self.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                value,
                size_bytes,
                access_count,
                last_access,
                created_at,
                tick,
            },
        );
        previous
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        self.current_bytes = self.current_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    /// Remove an entry only if it has not been touched or replaced since
    /// `tick` was observed.
    pub fn remove_if_tick(&mut self, key: &str, tick: u64) -> Option<CacheEntry<V>> {
        match self.entries.get(key) {
            Some(entry) if entry.tick == tick => self.remove(key),
            _ => None,
        }
    }

    /// Pop the least recently used entry.
    pub fn pop_lru(&mut self) -> Option<CacheEntry<V>> {
        let key = self.order.values().next()?.clone();
        self.remove(&key)
    }

    /// Pop the least recently used entry matching `predicate`.
    pub fn pop_lru_where(&mut self, predicate: impl Fn(&CacheEntry<V>) -> bool) -> Option<CacheEntry<V>> {
        let key = self
            .order
            .values()
            .find(|key| self.entries.get(*key).map(&predicate).unwrap_or(false))?
            .clone();
        self.remove(&key)
    }

    /// Keys from least to most recently used.
    pub fn keys_lru_order(&self) -> Vec<String> {
        self.order.values().cloned().collect()
    }

    /// Entries from least to most recently used.
    pub fn iter_lru(&self) -> impl Iterator<Item = &CacheEntry<V>> {
        self.order.values().filter_map(|key| self.entries.get(key))
    }

    pub fn drain(&mut self) -> Vec<CacheEntry<V>> {
        self.order.clear();
        self.current_bytes = 0;
        self.entries.drain().map(|(_, entry)| entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_order_follows_access() {
        let mut tier = LruTier::new(100, None);
        tier.insert("a".into(), 1, 10);
        tier.insert("b".into(), 2, 10);
        tier.insert("c".into(), 3, 10);
        tier.touch("a");

        assert_eq!(tier.keys_lru_order(), vec!["b", "c", "a"]);
        assert_eq!(tier.pop_lru().map(|e| e.key), Some("b".to_string()));
    }

    #[test]
    fn test_size_accounting() {
        let mut tier = LruTier::new(100, None);
        tier.insert("a".into(), (), 40);
        tier.insert("b".into(), (), 50);
        assert_eq!(tier.current_bytes(), 90);
        assert!(tier.fits(10, 0));
        assert!(!tier.fits(11, 0));
        assert!(!tier.fits(10, 1));

        // Replacement adjusts accounting instead of double counting.
        let previous = tier.insert("a".into(), (), 20);
        assert_eq!(previous.map(|e| e.size_bytes), Some(40));
        assert_eq!(tier.current_bytes(), 70);

        tier.remove("b");
        assert_eq!(tier.current_bytes(), 20);
    }

    #[test]
    fn test_entry_count_bound() {
        let mut tier = LruTier::new(u64::MAX, Some(2));
        tier.insert("a".into(), (), 1);
        assert!(tier.fits(1, 0));
        tier.insert("b".into(), (), 1);
        assert!(!tier.fits(1, 0));
    }

    #[test]
    fn test_pop_lru_where_skips_non_matching() {
        let mut tier = LruTier::new(100, None);
        tier.insert("active".into(), true, 1);
        tier.insert("warm".into(), false, 1);

        let victim = tier.pop_lru_where(|e| !e.value);
        assert_eq!(victim.map(|e| e.key), Some("warm".to_string()));
        assert!(tier.pop_lru_where(|e| !e.value).is_none());
    }

    #[test]
    fn test_remove_if_tick_detects_replacement() {
        let mut tier = LruTier::new(100, None);
        tier.insert("a".into(), 1, 1);
        let tick = tier.peek("a").unwrap().tick;
        tier.insert("a".into(), 2, 1);

        assert!(tier.remove_if_tick("a", tick).is_none());
        assert!(tier.contains("a"));
    }
}
