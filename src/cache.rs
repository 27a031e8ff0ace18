//! TTL-bounded cache shared by the importer, collector and dispatcher
//!
//! Two key namespaces are used: `trace:{trace_id}` maps a trace to the
//! `data_id` of its end-to-end root unit, and `hash:{content_hash}` marks a
//! hash that was already published. Last write wins.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Key under which a trace's root unit id is cached
pub fn trace_key(trace_id: &str) -> String {
    format!("trace:{trace_id}")
}

/// Key under which a published content hash is cached
pub fn hash_key(content_hash: &str) -> String {
    format!("hash:{content_hash}")
}

/// Shared string cache with per-entry expiry
pub trait TraceCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    /// Insert or overwrite; `ttl` of `None` uses the cache default
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>);

    fn remove(&self, key: &str);

    /// Live entry count
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Root unit id recorded for a trace
    fn root_for_trace(&self, trace_id: &str) -> Option<String> {
        self.get(&trace_key(trace_id))
    }

    fn remember_root(&self, trace_id: &str, data_id: &str) {
        self.set(&trace_key(trace_id), data_id, None);
    }

    fn seen_hash(&self, content_hash: &str) -> bool {
        self.get(&hash_key(content_hash)).is_some()
    }

    fn remember_hash(&self, content_hash: &str, data_id: &str) {
        self.set(&hash_key(content_hash), data_id, None);
    }
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
    inserted_at: Instant,
}

/// In-process [`TraceCache`] bounded by TTL and entry count
#[derive(Debug)]
pub struct MemoryTraceCache {
    default_ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryTraceCache {
    pub fn new(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            default_ttl,
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Drop expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }
}

impl TraceCache for MemoryTraceCache {
    fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let now = Instant::now();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        if !entries.contains_key(key) && entries.len() >= self.max_entries {
            entries.retain(|_, e| e.expires_at > now);
            if entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
                inserted_at: now,
            },
        );
    }

    fn remove(&self, key: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_and_hash_namespaces() {
        let cache = MemoryTraceCache::new(Duration::from_secs(60), 10);
        cache.remember_root("t-1", "unit-1");
        cache.remember_hash("abc", "unit-1");

        assert_eq!(cache.root_for_trace("t-1").as_deref(), Some("unit-1"));
        assert_eq!(cache.get("trace:t-1").as_deref(), Some("unit-1"));
        assert!(cache.seen_hash("abc"));
        assert!(!cache.seen_hash("t-1"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_last_write_wins() {
        let cache = MemoryTraceCache::new(Duration::from_secs(60), 10);
        cache.remember_root("t-1", "first");
        cache.remember_root("t-1", "second");
        assert_eq!(cache.root_for_trace("t-1").as_deref(), Some("second"));
    }

    #[test]
    fn test_entries_expire() {
        let cache = MemoryTraceCache::new(Duration::from_secs(60), 10);
        cache.set("short", "v", Some(Duration::from_millis(0)));
        cache.set("long", "v", None);
        assert!(cache.get("short").is_none());
        assert_eq!(cache.purge_expired(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = MemoryTraceCache::new(Duration::from_secs(60), 2);
        cache.set("a", "1", None);
        std::thread::sleep(Duration::from_millis(2));
        cache.set("b", "2", None);
        std::thread::sleep(Duration::from_millis(2));
        cache.set("c", "3", None);

        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b").as_deref(), Some("2"));
        assert_eq!(cache.get("c").as_deref(), Some("3"));
    }

    #[test]
    fn test_remove() {
        let cache = MemoryTraceCache::new(Duration::from_secs(60), 10);
        cache.set("k", "v", None);
        cache.remove("k");
        assert!(cache.is_empty());
    }
}
