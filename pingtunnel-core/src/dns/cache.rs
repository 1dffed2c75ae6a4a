//! The DNS response cache: keyed by (lowercased QNAME, QTYPE, QCLASS),
//! bounded to 1000 entries, TTL clamped to [60, 3600] seconds.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const MAX_ENTRIES: usize = 1000;
const EVICTION_BATCH: usize = 100;
const MIN_TTL_SECS: u32 = 60;
const MAX_TTL_SECS: u32 = 3600;
const DEFAULT_TTL_SECS: u32 = 300;

pub type CacheKey = (String, u16, u16);

struct Entry {
    response: Vec<u8>,
    expires_at: Instant,
    last_access: Instant,
}

pub fn clamp_ttl(ttl: Option<u32>) -> Duration {
    let secs = ttl.unwrap_or(DEFAULT_TTL_SECS).clamp(MIN_TTL_SECS, MAX_TTL_SECS);
    Duration::from_secs(secs as u64)
}

pub struct DnsCache {
    entries: Mutex<HashMap<CacheKey, Entry>>,
}

impl Default for DnsCache {
    fn default() -> Self {
        DnsCache {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a clone of the cached response body if present and not
    /// expired, bumping its last-access time.
    pub fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        let hit = entries.get_mut(key).filter(|entry| entry.expires_at > now).map(|entry| {
            entry.last_access = now;
            entry.response.clone()
        });
        if hit.is_none() {
            entries.remove(key);
        }
        hit
    }

    pub fn insert(&self, key: CacheKey, response: Vec<u8>, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap();
        self.evict_if_needed(&mut entries);
        let now = Instant::now();
        entries.insert(
            key,
            Entry {
                response,
                expires_at: now + ttl,
                last_access: now,
            },
        );
    }

    /// Removes all expired entries first; if still at capacity, removes
    /// the `EVICTION_BATCH` least-recently-accessed entries.
    fn evict_if_needed(&self, entries: &mut HashMap<CacheKey, Entry>) {
        if entries.len() < MAX_ENTRIES {
            return;
        }
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
        if entries.len() < MAX_ENTRIES {
            return;
        }
        let mut by_access: Vec<(CacheKey, Instant)> =
            entries.iter().map(|(k, v)| (k.clone(), v.last_access)).collect();
        by_access.sort_by_key(|(_, last_access)| *last_access);
        for (key, _) in by_access.into_iter().take(EVICTION_BATCH) {
            entries.remove(&key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> CacheKey {
        (name.to_string(), 1, 1)
    }

    #[test]
    fn clamp_ttl_enforces_bounds() {
        assert_eq!(clamp_ttl(Some(10)), Duration::from_secs(60));
        assert_eq!(clamp_ttl(Some(10_000)), Duration::from_secs(3600));
        assert_eq!(clamp_ttl(Some(120)), Duration::from_secs(120));
        assert_eq!(clamp_ttl(None), Duration::from_secs(300));
    }

    #[test]
    fn insert_then_get_returns_the_cached_body() {
        let cache = DnsCache::new();
        cache.insert(key("example.com"), vec![1, 2, 3], Duration::from_secs(60));
        assert_eq!(cache.get(&key("example.com")), Some(vec![1, 2, 3]));
    }

    #[test]
    fn get_on_expired_entry_returns_none_and_removes_it() {
        let cache = DnsCache::new();
        cache.insert(key("example.com"), vec![1, 2, 3], Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&key("example.com")), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn miss_on_unknown_key() {
        let cache = DnsCache::new();
        assert_eq!(cache.get(&key("missing.example.com")), None);
    }
}
