//! Two-tier cache: a bounded in-process LRU with per-entry TTL, plus
//! an optional distributed second tier behind the [`CacheTier`] trait.
//! The second tier degrades silently: any error there is treated as a
//! miss.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

/// Bounded LRU with TTL. Eviction is least-recently-accessed; expiry
/// is checked on read and by the periodic purge.
pub struct LruTtlCache<K: Eq + Hash + Clone, V: Clone> {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<CacheInner<K, V>>,
}

struct CacheInner<K, V> {
    map: HashMap<K, CacheEntry<V>>,
    access_counter: u64,
}

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    last_access: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> LruTtlCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                access_counter: 0,
            }),
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().await;
        let expired = match inner.map.get(key) {
            Some(entry) => entry.inserted_at.elapsed() >= self.ttl,
            None => return None,
        };
        if expired {
            inner.map.remove(key);
            return None;
        }
        inner.access_counter += 1;
        let counter = inner.access_counter;
        let entry = inner.map.get_mut(key)?;
        entry.last_access = counter;
        Some(entry.value.clone())
    }

    pub async fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock().await;
        inner.access_counter += 1;
        let counter = inner.access_counter;
        if !inner.map.contains_key(&key) && inner.map.len() >= self.capacity {
            // Evict the least recently accessed entry.
            if let Some(victim) = inner
                .map
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(k, _)| k.clone())
            {
                inner.map.remove(&victim);
            }
        }
        inner.map.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                last_access: counter,
            },
        );
    }

    pub async fn invalidate(&self, key: &K) {
        self.inner.lock().await.map.remove(key);
    }

    /// Drop expired entries; returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let before = inner.map.len();
        let ttl = self.ttl;
        inner.map.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
        before - inner.map.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Distributed second tier, keyed identically to the LRU. A Redis
/// implementation plugs in here; absence or failure degrades to
/// LRU-only.
#[async_trait]
pub trait CacheTier: Send + Sync {
    async fn get(&self, key: &str) -> Option<Vec<u8>>;
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration);
    async fn invalidate(&self, key: &str);
}

/// In-memory [`CacheTier`]; stands in for the distributed tier in
/// tests and single-node deployments.
#[derive(Default)]
pub struct MemoryTier {
    map: RwLock<HashMap<String, (Vec<u8>, Instant, Duration)>>,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let map = self.map.read().await;
        let (value, inserted_at, ttl) = map.get(key)?;
        if inserted_at.elapsed() >= *ttl {
            return None;
        }
        Some(value.clone())
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        self.map
            .write()
            .await
            .insert(key.to_string(), (value, Instant::now(), ttl));
    }

    async fn invalidate(&self, key: &str) {
        self.map.write().await.remove(key);
    }
}

/// LRU + optional second tier with JSON serialization across the tier
/// boundary.
pub struct SmartCache<V: Clone + Serialize + DeserializeOwned> {
    lru: LruTtlCache<String, V>,
    second: Option<Arc<dyn CacheTier>>,
    ttl: Duration,
}

impl<V: Clone + Serialize + DeserializeOwned> SmartCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            lru: LruTtlCache::new(capacity, ttl),
            second: None,
            ttl,
        }
    }

    pub fn with_second_tier(mut self, tier: Arc<dyn CacheTier>) -> Self {
        self.second = Some(tier);
        self
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        if let Some(value) = self.lru.get(&key.to_string()).await {
            return Some(value);
        }
        let tier = self.second.as_ref()?;
        let bytes = tier.get(key).await?;
        match serde_json::from_slice::<V>(&bytes) {
            Ok(value) => {
                self.lru.insert(key.to_string(), value.clone()).await;
                Some(value)
            }
            Err(err) => {
                tracing::debug!(key, error = %err, "second-tier cache entry unreadable");
                tier.invalidate(key).await;
                None
            }
        }
    }

    pub async fn put(&self, key: &str, value: V) {
        if let Some(tier) = &self.second {
            if let Ok(bytes) = serde_json::to_vec(&value) {
                tier.put(key, bytes, self.ttl).await;
            }
        }
        self.lru.insert(key.to_string(), value).await;
    }

    pub async fn invalidate(&self, key: &str) {
        self.lru.invalidate(&key.to_string()).await;
        if let Some(tier) = &self.second {
            tier.invalidate(key).await;
        }
    }

    pub async fn purge_expired(&self) -> usize {
        self.lru.purge_expired().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lru_hit_and_miss() {
        let cache: LruTtlCache<String, u32> =
            LruTtlCache::new(10, Duration::from_secs(60));
        cache.insert("a".to_string(), 1).await;
        assert_eq!(cache.get(&"a".to_string()).await, Some(1));
        assert_eq!(cache.get(&"b".to_string()).await, None);
    }

    #[tokio::test]
    async fn test_lru_evicts_least_recent() {
        let cache: LruTtlCache<String, u32> =
            LruTtlCache::new(2, Duration::from_secs(60));
        cache.insert("a".to_string(), 1).await;
        cache.insert("b".to_string(), 2).await;
        // Touch "a" so "b" is the eviction victim.
        cache.get(&"a".to_string()).await;
        cache.insert("c".to_string(), 3).await;

        assert_eq!(cache.get(&"a".to_string()).await, Some(1));
        assert_eq!(cache.get(&"b".to_string()).await, None);
        assert_eq!(cache.get(&"c".to_string()).await, Some(3));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache: LruTtlCache<String, u32> =
            LruTtlCache::new(10, Duration::from_millis(10));
        cache.insert("a".to_string(), 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get(&"a".to_string()).await, None);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let cache: LruTtlCache<String, u32> =
            LruTtlCache::new(10, Duration::from_millis(10));
        cache.insert("a".to_string(), 1).await;
        cache.insert("b".to_string(), 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.purge_expired().await, 2);
    }

    #[tokio::test]
    async fn test_smart_cache_second_tier_repopulates_lru() {
        let tier = Arc::new(MemoryTier::new());
        let cache: SmartCache<String> =
            SmartCache::new(10, Duration::from_secs(60)).with_second_tier(tier.clone());

        cache.put("k", "v".to_string()).await;
        // Simulate a process restart: fresh LRU, same second tier.
        let fresh: SmartCache<String> =
            SmartCache::new(10, Duration::from_secs(60)).with_second_tier(tier);
        assert_eq!(fresh.get("k").await, Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_smart_cache_without_second_tier() {
        let cache: SmartCache<String> = SmartCache::new(10, Duration::from_secs(60));
        cache.put("k", "v".to_string()).await;
        assert_eq!(cache.get("k").await, Some("v".to_string()));
        cache.invalidate("k").await;
        assert_eq!(cache.get("k").await, None);
    }
}
