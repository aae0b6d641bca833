//! Bounded in-process response cache
//!
//! Owned by one [`AcsClient`](super::AcsClient) and keyed by call signature.
//! Entries expire after a TTL and the oldest entry is evicted once the cache is
//! full. Estimates are never cached.

use census_common::types::{GeographyUnit, Group, Variable};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Default number of cached responses
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Default entry lifetime
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq)]
pub enum CachedResponse {
    Groups(Vec<Group>),
    Variables(Vec<Variable>),
    Geography(Vec<GeographyUnit>),
}

#[derive(Debug, Default)]
struct Entries {
    values: HashMap<String, (Instant, CachedResponse)>,
    order: VecDeque<String>,
}

impl Entries {
    fn remove(&mut self, key: &str) -> bool {
        let removed = self.values.remove(key).is_some();
        if removed {
            self.order.retain(|k| k != key);
        }
        removed
    }
}

#[derive(Debug)]
pub struct ResponseCache {
    capacity: usize,
    ttl: Duration,
    entries: Mutex<Entries>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL)
    }
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            entries: Mutex::new(Entries::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        let mut entries = self.lock();
        let expired = match entries.values.get(key) {
            Some((stored_at, value)) if stored_at.elapsed() < self.ttl => {
                debug!(key, "Response cache hit");
                return Some(value.clone());
            },
            Some(_) => true,
            None => false,
        };
        if expired {
            debug!(key, "Response cache entry expired");
            entries.remove(key);
        }
        None
    }

    pub fn insert(&self, key: impl Into<String>, value: CachedResponse) {
        if self.capacity == 0 {
            return;
        }
        let key = key.into();
        let mut entries = self.lock();
        entries.remove(&key);
        while entries.values.len() >= self.capacity {
            match entries.order.pop_front() {
                Some(oldest) => {
                    entries.values.remove(&oldest);
                },
                None => break,
            }
        }
        entries.order.push_back(key.clone());
        entries.values.insert(key, (Instant::now(), value));
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.lock().remove(key)
    }

    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.values.clear();
        entries.order.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn groups(id: &str) -> CachedResponse {
        CachedResponse::Groups(vec![Group {
            id: id.to_string(),
            description: "test".to_string(),
            variable_count: 0,
        }])
    }

    #[test]
    fn test_evicts_oldest_when_full() {
        let cache = ResponseCache::new(2, DEFAULT_CACHE_TTL);
        cache.insert("a", groups("A"));
        cache.insert("b", groups("B"));
        cache.insert("c", groups("C"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("c"), Some(groups("C")));
    }

    #[test]
    fn test_reinsert_refreshes_position() {
        let cache = ResponseCache::new(2, DEFAULT_CACHE_TTL);
        cache.insert("a", groups("A"));
        cache.insert("b", groups("B"));
        cache.insert("a", groups("A2"));
        cache.insert("c", groups("C"));

        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("a"), Some(groups("A2")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = ResponseCache::new(4, Duration::from_secs(10));
        cache.insert("a", groups("A"));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cache.get("a").is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = ResponseCache::default();
        cache.insert("a", groups("A"));
        cache.insert("b", groups("B"));

        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_capacity_disables_caching() {
        let cache = ResponseCache::new(0, DEFAULT_CACHE_TTL);
        cache.insert("a", groups("A"));
        assert!(cache.is_empty());
    }
}
