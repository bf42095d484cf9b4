//! In-process L1 store.
//!
//! A bounded LRU map keyed by `tag:key` with a per-entry creation time for
//! TTL checks.  Values are held as parsed JSON; the L1 form is never
//! compressed.  Writes never fail.

use lru::LruCache;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry {
    value: Value,
    created: Instant,
    ttl: Duration,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.created) >= self.ttl
    }
}

/// Bounded LRU map with TTLs.  All operations take the single internal
/// guard briefly; none perform I/O.
pub struct MemoryStore {
    entries: Mutex<LruCache<String, Entry>>,
}

impl MemoryStore {
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).expect("max(1) is non-zero");
        MemoryStore {
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.get_at(key, Instant::now())
    }

    /// Clock-injected variant of [`MemoryStore::get`].  An expired entry is
    /// removed on access and reads as a miss.
    pub fn get_at(&self, key: &str, now: Instant) -> Option<Value> {
        let mut entries = self.entries.lock().unwrap();
        let expired = entries.get(key).is_some_and(|entry| entry.expired(now));
        if expired {
            entries.pop(key);
            return None;
        }
        entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn set(&self, key: String, value: Value, ttl: Duration) {
        self.set_at(key, value, ttl, Instant::now());
    }

    pub fn set_at(&self, key: String, value: Value, ttl: Duration, now: Instant) {
        self.entries.lock().unwrap().put(key, Entry {
            value,
            created: now,
            ttl,
        });
    }

    /// Returns true when the key was present.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().unwrap().pop(key).is_some()
    }

    /// Remove every entry whose key starts with `prefix`; returns the count.
    /// The guard is held only long enough to collect and drop the matches.
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let matching: Vec<String> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &matching {
            entries.pop(key);
        }
        matching.len()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove entries whose age has reached their TTL; returns the count.
    /// Called from the background sweep task.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }
}
