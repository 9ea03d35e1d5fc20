use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info};

use crate::utils::duration_ms;

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(with = "duration_ms")]
    pub default_ttl: Duration,
    pub max_cache_size: usize,
    #[serde(with = "duration_ms")]
    pub cleanup_interval: Duration,
    #[serde(with = "duration_ms")]
    pub session_token_ttl: Duration,
    #[serde(with = "duration_ms")]
    pub metadata_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_cache_size: 1000,
            cleanup_interval: Duration::from_secs(60),
            session_token_ttl: Duration::from_secs(1800),
            metadata_ttl: Duration::from_secs(600),
        }
    }
}

/// Cache entry with metadata
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub created_at: Instant,
    pub ttl: Duration,
    sequence: u64,
}

impl<V> CacheEntry<V> {
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }
}

/// Cache statistics, computed by scanning at call time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatistics {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
    pub max_cache_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    insertion_order: BTreeMap<u64, String>,
    next_sequence: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

struct CacheInner<V> {
    config: CacheConfig,
    state: Mutex<CacheState<V>>,
}

impl<V> CacheInner<V> {
    fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();

        let expired: Vec<(String, u64)> = state
            .entries
            .values()
            .filter(|entry| entry.is_expired_at(now))
            .map(|entry| (entry.key.clone(), entry.sequence))
            .collect();

        for (key, sequence) in &expired {
            state.entries.remove(key);
            state.insertion_order.remove(sequence);
        }

        if !expired.is_empty() {
            debug!(
                expired_count = expired.len(),
                "Cleaned up expired cache entries"
            );
        }
        expired.len()
    }
}

/// TTL cache with an entry ceiling and a background sweep.
///
/// When full, inserting a new key evicts the entry with the oldest
/// creation time. Expiry is checked lazily on read; the sweep only
/// reclaims entries nobody reads again.
pub struct CacheManager<V> {
    inner: Arc<CacheInner<V>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<V> CacheManager<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Must be called inside a tokio runtime for the sweep to run.
    pub fn new(config: CacheConfig) -> Self {
        let cleanup_interval = config.cleanup_interval;
        let inner = Arc::new(CacheInner {
            config,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                insertion_order: BTreeMap::new(),
                next_sequence: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        });

        let sweeper = match Handle::try_current() {
            Ok(handle) => Some(handle.spawn(Self::sweep_loop(
                Arc::downgrade(&inner),
                cleanup_interval,
            ))),
            Err(_) => {
                debug!("No tokio runtime available, cache sweep disabled");
                None
            }
        };

        Self {
            inner,
            sweeper: Mutex::new(sweeper),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Store a value with `ttl`, or the configured default TTL.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let key = key.into();
        let ttl = ttl.unwrap_or(self.inner.config.default_ttl);
        let max_size = self.inner.config.max_cache_size.max(1);
        let mut state = self.inner.state.lock();

        if let Some(previous) = state.entries.remove(&key) {
            state.insertion_order.remove(&previous.sequence);
        } else if state.entries.len() >= max_size {
            if let Some((_, oldest_key)) = state.insertion_order.pop_first() {
                state.entries.remove(&oldest_key);
                state.evictions += 1;
                debug!(key = %oldest_key, "Evicted oldest cache entry");
            }
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.insertion_order.insert(sequence, key.clone());
        state.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                value,
                created_at: Instant::now(),
                ttl,
                sequence,
            },
        );
    }

    /// Fetch a live value; expired entries read as absent.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut state = self.inner.state.lock();

        let value = state
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.value.clone());

        match value {
            Some(value) => {
                state.hits += 1;
                debug!(key = key, "Cache hit");
                Some(value)
            }
            None => {
                state.misses += 1;
                debug!(key = key, "Cache miss");
                None
            }
        }
    }

    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        self.inner
            .state
            .lock()
            .entries
            .get(key)
            .map_or(false, |entry| !entry.is_expired_at(now))
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.inner.state.lock();
        match state.entries.remove(key) {
            Some(entry) => {
                state.insertion_order.remove(&entry.sequence);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.entries.clear();
        state.insertion_order.clear();
        info!("Cleared cache");
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_session_token(&self, key: impl Into<String>, token: V) {
        self.set(key, token, Some(self.inner.config.session_token_ttl));
    }

    pub fn get_session_token(&self, key: &str) -> Option<V> {
        self.get(key)
    }

    pub fn set_metadata(&self, key: impl Into<String>, metadata: V) {
        self.set(key, metadata, Some(self.inner.config.metadata_ttl));
    }

    pub fn get_metadata(&self, key: &str) -> Option<V> {
        self.get(key)
    }

    /// Remove every expired entry now. Returns how many were dropped.
    pub fn cleanup(&self) -> usize {
        self.inner.cleanup()
    }

    pub fn get_statistics(&self) -> CacheStatistics {
        let now = Instant::now();
        let state = self.inner.state.lock();
        let valid_entries = state
            .entries
            .values()
            .filter(|entry| !entry.is_expired_at(now))
            .count();

        CacheStatistics {
            total_entries: state.entries.len(),
            valid_entries,
            expired_entries: state.entries.len() - valid_entries,
            max_cache_size: self.inner.config.max_cache_size,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }

    /// Stop the background sweep. Safe to call more than once.
    pub fn destroy(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
            info!("Stopped cache cleanup task");
        }
    }

    async fn sweep_loop(inner: Weak<CacheInner<V>>, period: Duration) {
        let period = period.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);

        loop {
            ticker.tick().await;
            let Some(cache) = inner.upgrade() else {
                break;
            };
            cache.cleanup();
        }
    }
}

impl<V> Drop for CacheManager<V> {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn small_config(max_cache_size: usize) -> CacheConfig {
        CacheConfig {
            max_cache_size,
            ..CacheConfig::default()
        }
    }

    #[tokio::test]
    async fn test_cache_manager() {
        let cache: CacheManager<String> = CacheManager::new(CacheConfig::default());

        cache.set("key1", "value1".to_string(), None);
        assert_eq!(cache.get("key1"), Some("value1".to_string()));
        assert!(cache.has("key1"));

        assert_eq!(cache.get("nonexistent"), None);
        assert!(!cache.has("nonexistent"));

        assert!(cache.delete("key1"));
        assert!(!cache.delete("key1"));
        assert_eq!(cache.get("key1"), None);

        let stats = cache.get_statistics();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        cache.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expiration() {
        let cache: CacheManager<String> = CacheManager::new(CacheConfig::default());

        cache.set("key1", "value1".to_string(), Some(Duration::from_millis(100)));
        assert_eq!(cache.get("key1"), Some("value1".to_string()));

        sleep(Duration::from_millis(150)).await;

        assert_eq!(cache.get("key1"), None);
        assert!(!cache.has("key1"));

        // Not swept yet: counted in total, not in valid
        let stats = cache.get_statistics();
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.valid_entries, 0);
        assert_eq!(stats.expired_entries, 1);
        cache.destroy();
    }

    #[tokio::test]
    async fn test_eviction_removes_oldest_entry() {
        let cache: CacheManager<u32> = CacheManager::new(small_config(3));

        for i in 0..4 {
            cache.set(format!("k{}", i), i, None);
        }

        assert_eq!(cache.len(), 3);
        assert!(!cache.has("k0"));
        assert!(cache.has("k1"));
        assert!(cache.has("k3"));
        assert_eq!(cache.get_statistics().evictions, 1);
        cache.destroy();
    }

    #[tokio::test]
    async fn test_overwrite_does_not_evict() {
        let cache: CacheManager<u32> = CacheManager::new(small_config(2));

        cache.set("a", 1, None);
        cache.set("b", 2, None);
        cache.set("a", 10, None);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(10));

        // "b" is now the oldest
        cache.set("c", 3, None);
        assert!(!cache.has("b"));
        assert!(cache.has("a"));
        cache.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_cleanup() {
        let cache: CacheManager<u32> = CacheManager::new(CacheConfig::default());

        cache.set("short", 1, Some(Duration::from_millis(10)));
        cache.set("long", 2, Some(Duration::from_secs(60)));
        sleep(Duration::from_millis(20)).await;

        assert_eq!(cache.cleanup(), 1);
        let stats = cache.get_statistics();
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.valid_entries, 1);
        cache.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_and_metadata_ttls() {
        let cache: CacheManager<String> = CacheManager::new(CacheConfig {
            session_token_ttl: Duration::from_millis(50),
            metadata_ttl: Duration::from_millis(500),
            ..CacheConfig::default()
        });

        cache.set_session_token("session:admin", "JSESSIONID=abc".to_string());
        cache.set_metadata("metadata:/reports/sales", "{\"type\":\"reportUnit\"}".to_string());

        sleep(Duration::from_millis(100)).await;

        assert_eq!(cache.get_session_token("session:admin"), None);
        assert!(cache.get_metadata("metadata:/reports/sales").is_some());
        cache.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_and_destroy() {
        let cache: CacheManager<u32> = CacheManager::new(CacheConfig {
            cleanup_interval: Duration::from_millis(20),
            ..CacheConfig::default()
        });

        cache.set("a", 1, Some(Duration::from_millis(5)));
        sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.len(), 0);

        cache.destroy();
        cache.destroy();

        cache.set("b", 2, Some(Duration::from_millis(5)));
        sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_construction_without_runtime() {
        let cache: CacheManager<u32> = CacheManager::new(CacheConfig::default());
        cache.set("a", 1, None);
        assert_eq!(cache.get("a"), Some(1));
        cache.destroy();
    }
}
