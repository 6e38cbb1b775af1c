//! Read-through cache for denormalised views.
//!
//! Keys are namespaced by entity type:
//!
//! * detail views: `{entity_type}:{entity_id}:{view}`
//! * list views: `{entity_type}_list:{actor_id}:{serialized_filters}`
//!
//! Writes purge by prefix, so a change to one record drops its detail views
//! and every cached list. Nothing here is authoritative; every caller must
//! stay correct with [`NoopCache`].
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub const BOL_ENTITY: &str = "bol";

pub fn detail_key(entity_type: &str, entity_id: &str, view: &str) -> String {
    format!("{entity_type}:{entity_id}:{view}")
}

/// Filters are sorted by name so equal filter sets share a key.
pub fn list_key(entity_type: &str, actor_id: &str, filters: &BTreeMap<String, String>) -> String {
    let serialized: Vec<String> = filters.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{entity_type}_list:{actor_id}:{}", serialized.join("&"))
}

/// Prefix covering every detail view of one record.
pub fn entity_prefix(entity_type: &str, entity_id: &str) -> String {
    format!("{entity_type}:{entity_id}:")
}

/// Prefix covering every list view of an entity type.
pub fn list_prefix(entity_type: &str) -> String {
    format!("{entity_type}_list:")
}

pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration);
    /// Drop every entry whose key starts with `prefix`, returns how many went.
    fn invalidate_pattern(&self, prefix: &str) -> usize;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub invalidated: u64,
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    invalidated: AtomicU64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            invalidated: self.invalidated.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let found = match self.entries.read() {
            Ok(entries) => entries
                .get(key)
                .map(|entry| (entry.expires_at > now).then(|| entry.value.clone())),
            // a poisoned cache is a cold cache
            Err(_) => None,
        };

        match found {
            Some(Some(value)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Some(None) => {
                if let Ok(mut entries) = self.entries.write() {
                    if entries.get(key).is_some_and(|entry| entry.expires_at <= now) {
                        entries.remove(key);
                    }
                }
                self.expired.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                key.to_string(),
                Entry {
                    value,
                    expires_at: Instant::now() + ttl,
                },
            );
        }
    }

    fn invalidate_pattern(&self, prefix: &str) -> usize {
        let Ok(mut entries) = self.entries.write() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        let purged = before - entries.len();
        self.invalidated.fetch_add(purged as u64, Ordering::Relaxed);
        purged
    }
}

/// Cache that never holds anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

impl Cache for NoopCache {
    fn get(&self, _key: &str) -> Option<Vec<u8>> {
        None
    }
    fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) {}
    fn invalidate_pattern(&self, _prefix: &str) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn prefix_purge_spares_other_records() {
        let cache = MemoryCache::new();
        cache.set(&detail_key(BOL_ENTITY, "BOL-2026-000001", "detail"), vec![1], TTL);
        cache.set(&detail_key(BOL_ENTITY, "BOL-2026-000001", "history"), vec![2], TTL);
        cache.set(&detail_key(BOL_ENTITY, "BOL-2026-0000010", "detail"), vec![3], TTL);
        cache.set(&list_key(BOL_ENTITY, "user_a", &BTreeMap::new()), vec![4], TTL);

        let purged = cache.invalidate_pattern(&entity_prefix(BOL_ENTITY, "BOL-2026-000001"));
        assert_eq!(purged, 2);
        assert!(cache.get(&detail_key(BOL_ENTITY, "BOL-2026-0000010", "detail")).is_some());

        assert_eq!(cache.invalidate_pattern(&list_prefix(BOL_ENTITY)), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn list_keys_are_order_independent() {
        let a = BTreeMap::from([
            ("status".to_string(), "en_route".to_string()),
            ("carrier".to_string(), "contact_k".to_string()),
        ]);
        let b = BTreeMap::from([
            ("carrier".to_string(), "contact_k".to_string()),
            ("status".to_string(), "en_route".to_string()),
        ]);
        assert_eq!(list_key(BOL_ENTITY, "u", &a), list_key(BOL_ENTITY, "u", &b));
        assert_eq!(
            list_key(BOL_ENTITY, "u", &a),
            "bol_list:u:carrier=contact_k&status=en_route"
        );
    }

    #[test]
    fn expired_entries_miss() {
        let cache = MemoryCache::new();
        cache.set("bol:x:detail", vec![9], Duration::ZERO);
        assert_eq!(cache.get("bol:x:detail"), None);
        assert_eq!(cache.stats().expired, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn noop_cache_is_always_cold() {
        let cache = NoopCache;
        cache.set("bol:x:detail", vec![1], TTL);
        assert_eq!(cache.get("bol:x:detail"), None);
    }
}
