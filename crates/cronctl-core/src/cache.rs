//! Key/value cache used for lock state and query snapshots.
//!
//! Entries are ephemeral: any value may disappear at any time (TTL expiry or
//! eviction), and callers must treat a missing key as "never set".

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

/// Minimal object-cache contract.
///
/// A `ttl` of `None` or zero means the entry never expires. Implementations
/// backed by a shared store make locks work across processes; [`MemoryCache`]
/// only coordinates threads within one process.
pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&self, key: &str, value: Value, ttl: Option<Duration>);

    /// Store `value` only if `key` is absent. Returns whether it was stored.
    fn add(&self, key: &str, value: Value, ttl: Option<Duration>) -> bool;

    /// Returns whether a live entry was removed.
    fn delete(&self, key: &str) -> bool;

    /// Atomically add `by` to an integer entry. `None` if the key is missing
    /// or holds a non-integer.
    fn incr(&self, key: &str, by: i64) -> Option<i64>;

    /// Atomically subtract `by`, flooring at zero.
    fn decr(&self, key: &str, by: i64) -> Option<i64>;
}

struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        let expires_at = ttl
            .filter(|d| !d.is_zero())
            .map(|d| Instant::now() + d);
        Self { value, expires_at }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process cache on a concurrent map with lazy TTL expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) entries.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn adjust(&self, key: &str, delta: i64) -> Option<i64> {
        let mut entry = self.entries.get_mut(key)?;
        if entry.is_expired() {
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired());
            return None;
        }
        let current = entry.value.as_i64()?;
        let next = (current + delta).max(0);
        entry.value = Value::from(next);
        Some(next)
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Option<Value> {
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired());
            return None;
        }
        Some(entry.value.clone())
    }

    fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        self.entries
            .insert(key.to_string(), CacheEntry::new(value, ttl));
    }

    fn add(&self, key: &str, value: Value, ttl: Option<Duration>) -> bool {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(CacheEntry::new(value, ttl));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::new(value, ttl));
                true
            }
        }
    }

    fn delete(&self, key: &str) -> bool {
        self.entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired())
    }

    fn incr(&self, key: &str, by: i64) -> Option<i64> {
        self.adjust(key, by)
    }

    fn decr(&self, key: &str, by: i64) -> Option<i64> {
        self.adjust(key, -by)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_then_get() {
        let cache = MemoryCache::new();
        cache.set("k", json!({"a": 1}), None);
        assert_eq!(cache.get("k"), Some(json!({"a": 1})));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn add_only_when_absent() {
        let cache = MemoryCache::new();
        assert!(cache.add("k", json!(1), None));
        assert!(!cache.add("k", json!(2), None));
        assert_eq!(cache.get("k"), Some(json!(1)));
    }

    #[test]
    fn expired_entries_vanish() {
        let cache = MemoryCache::new();
        cache.set("k", json!(1), Some(Duration::from_millis(10)));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get("k"), None);
        // an expired key can be re-added
        assert!(cache.add("k", json!(2), None));
        assert_eq!(cache.get("k"), Some(json!(2)));
    }

    #[test]
    fn zero_ttl_never_expires() {
        let cache = MemoryCache::new();
        cache.set("k", json!("v"), Some(Duration::ZERO));
        assert_eq!(cache.get("k"), Some(json!("v")));
    }

    #[test]
    fn incr_decr_floor_at_zero() {
        let cache = MemoryCache::new();
        assert_eq!(cache.incr("n", 1), None);
        cache.set("n", json!(0), None);
        assert_eq!(cache.incr("n", 2), Some(2));
        assert_eq!(cache.decr("n", 5), Some(0));
    }

    #[test]
    fn incr_rejects_non_integer() {
        let cache = MemoryCache::new();
        cache.set("list", json!([1, 2]), None);
        assert_eq!(cache.incr("list", 1), None);
    }

    #[test]
    fn delete_reports_live_removal() {
        let cache = MemoryCache::new();
        cache.set("k", json!(1), None);
        assert!(cache.delete("k"));
        assert!(!cache.delete("k"));
        assert!(cache.is_empty());
    }
}
