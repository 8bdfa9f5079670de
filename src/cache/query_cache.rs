//! Read-through cache in front of feed queries.
//!
//! Values are stored as JSON. Every backend round trip is bounded by the
//! configured timeout; a slow or failing backend turns reads into misses and
//! writes into no-ops so callers fall back to the engagement store.
//!
//! Invalidation advances a per-family generation before deleting entries.
//! A read-through load records the generation of its family before it runs
//! and only publishes its result while that generation is unchanged, so a
//! page loaded before a write can never outlive that write's invalidation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use super::config::CacheConfig;
use super::keys::{CacheKey, KeyFamily};
use super::store::{CacheBackend, CacheError, MemoryBackend};

pub(crate) const METRIC_CACHE_HIT: &str = "emberfeed_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS: &str = "emberfeed_cache_miss_total";
pub(crate) const METRIC_CACHE_ERROR: &str = "emberfeed_cache_error_total";
pub(crate) const METRIC_CACHE_INVALIDATED: &str = "emberfeed_cache_invalidated_total";
pub(crate) const METRIC_CACHE_STALE_LOAD: &str = "emberfeed_cache_stale_load_total";

#[derive(Clone)]
pub struct QueryCache {
    backend: Option<Arc<dyn CacheBackend>>,
    config: CacheConfig,
}

impl QueryCache {
    /// `backend` is ignored when the configuration disables caching.
    pub fn new(backend: Option<Arc<dyn CacheBackend>>, config: CacheConfig) -> Self {
        let backend = backend.filter(|_| config.enabled);
        Self { backend, config }
    }

    pub fn in_memory(config: CacheConfig) -> Self {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new(&config));
        Self::new(Some(backend), config)
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self {
            backend: None,
            config: CacheConfig {
                enabled: false,
                ..CacheConfig::default()
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend
            .as_ref()
            .map(|backend| backend.name())
            .unwrap_or("none")
    }

    pub fn ttl_for(&self, family: KeyFamily) -> Duration {
        self.config.ttls.for_family(family)
    }

    /// Look up a cached value; any backend or decoding failure is a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let backend = self.backend.as_ref()?;
        let family = key.family().as_str();

        let raw = match self.bounded(backend.get(key.as_str())).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                counter!(METRIC_CACHE_MISS, "family" => family).increment(1);
                return None;
            }
            Err(err) => {
                counter!(METRIC_CACHE_ERROR, "family" => family, "op" => "get").increment(1);
                warn!(key = %key, error = %err, "Cache read failed; falling back to store");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => {
                counter!(METRIC_CACHE_HIT, "family" => family).increment(1);
                debug!(key = %key, "Cache hit");
                Some(value)
            }
            Err(err) => {
                counter!(METRIC_CACHE_ERROR, "family" => family, "op" => "decode").increment(1);
                warn!(key = %key, error = %err, "Dropping undecodable cache entry");
                if let Err(err) = self.bounded(backend.delete(key.as_str())).await {
                    warn!(key = %key, error = %err, "Failed to drop undecodable cache entry");
                }
                None
            }
        }
    }

    /// Store a value under `key` with an explicit TTL.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &CacheKey, value: &T, ttl: Duration) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        let family = key.family().as_str();

        let result = match serde_json::to_string(value) {
            Ok(encoded) => self.bounded(backend.set(key.as_str(), encoded, ttl)).await,
            Err(err) => Err(CacheError::from(err)),
        };
        if let Err(err) = result {
            counter!(METRIC_CACHE_ERROR, "family" => family, "op" => "set").increment(1);
            warn!(key = %key, error = %err, "Cache write failed");
        }
    }

    /// Store a value with the TTL of its key family.
    pub async fn put<T: Serialize + ?Sized>(&self, key: &CacheKey, value: &T) {
        self.set(key, value, self.ttl_for(key.family())).await;
    }

    /// Serve `key` from cache, or run `load` and cache its successful result.
    ///
    /// The result is returned either way, but it is not left in the cache if
    /// the key's family was invalidated while `load` ran.
    pub async fn get_or_load<T, E, F, Fut>(&self, key: &CacheKey, load: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.get(key).await {
            return Ok(hit);
        }
        let generation = self.generation(key.family()).await;
        let value = load().await?;
        if let Some(generation) = generation {
            self.put_if_current(key, &value, generation).await;
        }
        Ok(value)
    }

    /// Store `value` only while `key`'s family is still at `generation`.
    ///
    /// An invalidation bumps the generation before deleting, so checking again
    /// after the write catches one that slipped in between check and write.
    async fn put_if_current<T: Serialize + ?Sized>(
        &self,
        key: &CacheKey,
        value: &T,
        generation: u64,
    ) {
        let family = key.family();
        if self.generation(family).await != Some(generation) {
            self.discard_stale(key, "before_put");
            return;
        }

        self.put(key, value).await;

        if self.generation(family).await != Some(generation) {
            self.discard_stale(key, "after_put");
            if let Some(backend) = self.backend.as_ref()
                && let Err(err) = self.bounded(backend.delete(key.as_str())).await
            {
                counter!(METRIC_CACHE_ERROR, "family" => family.as_str(), "op" => "delete")
                    .increment(1);
                warn!(key = %key, error = %err, "Failed to drop a result loaded before invalidation");
            }
        }
    }

    fn discard_stale(&self, key: &CacheKey, stage: &'static str) {
        counter!(METRIC_CACHE_STALE_LOAD, "family" => key.family().as_str(), "stage" => stage)
            .increment(1);
        debug!(key = %key, stage, "Family invalidated during load; result not cached");
    }

    /// Generation of `family`, or `None` when it cannot be read.
    async fn generation(&self, family: KeyFamily) -> Option<u64> {
        let backend = self.backend.as_ref()?;
        match self.bounded(backend.generation(family.prefix())).await {
            Ok(generation) => Some(generation),
            Err(err) => {
                counter!(METRIC_CACHE_ERROR, "family" => family.as_str(), "op" => "generation")
                    .increment(1);
                warn!(family = family.as_str(), error = %err, "Cache generation read failed");
                None
            }
        }
    }

    /// Drop every entry whose key starts with `prefix`, returning how many
    /// were removed.
    pub async fn invalidate_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let Some(backend) = self.backend.as_ref() else {
            return Ok(0);
        };
        let mut bumped: Result<(), CacheError> = Ok(());
        for family in KeyFamily::overlapping(prefix) {
            if let Err(err) = self.bounded(backend.bump_generation(family.prefix())).await {
                bumped = Err(err);
            }
        }
        let removed = self.bounded(backend.delete_prefix(prefix)).await?;
        bumped?;
        counter!(METRIC_CACHE_INVALIDATED, "kind" => "prefix").increment(removed);
        debug!(prefix, removed, "Invalidated cache prefix");
        Ok(removed)
    }

    /// Drop one entry, returning whether it was cached.
    pub async fn invalidate_key(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let Some(backend) = self.backend.as_ref() else {
            return Ok(false);
        };
        let bumped = self
            .bounded(backend.bump_generation(key.family().prefix()))
            .await;
        let removed = self.bounded(backend.delete(key.as_str())).await?;
        bumped?;
        if removed {
            counter!(METRIC_CACHE_INVALIDATED, "kind" => "key").increment(1);
        }
        debug!(key = %key, removed, "Invalidated cache key");
        Ok(removed)
    }

    async fn bounded<T>(
        &self,
        operation: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        let timeout = self.config.op_timeout;
        match tokio::time::timeout(timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout {
                backend: self.backend_name(),
                timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::application::pagination::FeedParams;

    /// Backend whose every call hangs past any timeout.
    struct StalledBackend;

    #[async_trait]
    impl CacheBackend for StalledBackend {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            std::future::pending().await
        }

        async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
            std::future::pending().await
        }

        async fn delete(&self, _key: &str) -> Result<bool, CacheError> {
            std::future::pending().await
        }

        async fn delete_prefix(&self, _prefix: &str) -> Result<u64, CacheError> {
            std::future::pending().await
        }

        async fn generation(&self, _scope: &str) -> Result<u64, CacheError> {
            std::future::pending().await
        }

        async fn bump_generation(&self, _scope: &str) -> Result<u64, CacheError> {
            std::future::pending().await
        }
    }

    /// Memory backend on which the next `set` is preceded by a complete
    /// invalidation of the `posts:` family, as a concurrent writer would do.
    struct InvalidatedBeforeSet {
        inner: MemoryBackend,
        armed: AtomicBool,
    }

    #[async_trait]
    impl CacheBackend for InvalidatedBeforeSet {
        fn name(&self) -> &'static str {
            "memory"
        }

        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.inner.bump_generation(KeyFamily::Posts.prefix()).await?;
                self.inner.delete_prefix(KeyFamily::Posts.prefix()).await?;
            }
            self.inner.set(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<bool, CacheError> {
            self.inner.delete(key).await
        }

        async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
            self.inner.delete_prefix(prefix).await
        }

        async fn generation(&self, scope: &str) -> Result<u64, CacheError> {
            self.inner.generation(scope).await
        }

        async fn bump_generation(&self, scope: &str) -> Result<u64, CacheError> {
            self.inner.bump_generation(scope).await
        }
    }

    fn tags_key() -> CacheKey {
        CacheKey::all_tags()
    }

    #[tokio::test]
    async fn get_or_load_loads_once_then_hits() {
        let cache = QueryCache::in_memory(CacheConfig::default());
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let tags: Result<Vec<String>, ()> = cache
                .get_or_load(&tags_key(), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(vec!["rust".to_string()])
                })
                .await;
            assert_eq!(tags, Ok(vec!["rust".to_string()]));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn load_overtaken_by_invalidation_is_not_cached() {
        let cache = QueryCache::in_memory(CacheConfig::default());
        let key = CacheKey::post_list(&FeedParams::default(), None);

        let stale: Result<Vec<u32>, ()> = cache
            .get_or_load(&key, || async {
                // A write commits and invalidates while the store read is in flight.
                cache.invalidate_prefix("posts:").await.expect("invalidate");
                Ok(Vec::new())
            })
            .await;
        assert_eq!(stale, Ok(Vec::new()), "the caller still gets its result");
        assert_eq!(cache.get::<Vec<u32>>(&key).await, None);

        let fresh: Result<Vec<u32>, ()> = cache.get_or_load(&key, || async { Ok(vec![7]) }).await;
        assert_eq!(fresh, Ok(vec![7]));
        assert_eq!(cache.get::<Vec<u32>>(&key).await, Some(vec![7]));
    }

    #[tokio::test]
    async fn invalidation_between_check_and_put_is_undone() {
        let backend = Arc::new(InvalidatedBeforeSet {
            inner: MemoryBackend::new(&CacheConfig::default()),
            armed: AtomicBool::new(true),
        });
        let shared: Arc<dyn CacheBackend> = backend.clone();
        let cache = QueryCache::new(Some(shared), CacheConfig::default());
        let key = CacheKey::post_list(&FeedParams::default(), Some(4));

        let loaded: Result<Vec<u32>, ()> = cache.get_or_load(&key, || async { Ok(vec![1]) }).await;
        assert_eq!(loaded, Ok(vec![1]));
        assert_eq!(cache.get::<Vec<u32>>(&key).await, None);
        assert!(backend.inner.is_empty());
    }

    #[tokio::test]
    async fn invalidating_an_absent_key_reports_nothing_removed() {
        let cache = QueryCache::in_memory(CacheConfig::default());
        assert!(!cache.invalidate_key(&tags_key()).await.expect("invalidate"));

        cache.put(&tags_key(), &vec!["a"]).await;
        assert!(cache.invalidate_key(&tags_key()).await.expect("invalidate"));
    }

    #[tokio::test]
    async fn failed_loads_are_not_cached() {
        let cache = QueryCache::in_memory(CacheConfig::default());

        let first: Result<Vec<String>, &str> =
            cache.get_or_load(&tags_key(), || async { Err("down") }).await;
        assert_eq!(first, Err("down"));
        assert_eq!(cache.get::<Vec<String>>(&tags_key()).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn family_ttl_expires_entries() {
        let cache = QueryCache::in_memory(CacheConfig::default());
        let key = CacheKey::trending(&Default::default());
        cache.put(&key, &vec![1, 2, 3]).await;

        tokio::time::advance(cache.ttl_for(KeyFamily::Trending) - Duration::from_secs(1)).await;
        assert_eq!(cache.get::<Vec<u8>>(&key).await, Some(vec![1, 2, 3]));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get::<Vec<u8>>(&key).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_backend_degrades_to_misses() {
        let backend: Arc<dyn CacheBackend> = Arc::new(StalledBackend);
        let cache = QueryCache::new(Some(backend), CacheConfig::default());

        cache.put(&tags_key(), &vec!["a"]).await;
        assert_eq!(cache.get::<Vec<String>>(&tags_key()).await, None);

        let err = cache
            .invalidate_prefix("posts:")
            .await
            .expect_err("stalled backend times out");
        assert!(matches!(err, CacheError::Timeout { backend: "stalled", .. }));

        let loaded: Result<Vec<String>, ()> = cache
            .get_or_load(&tags_key(), || async { Ok(vec!["fresh".into()]) })
            .await;
        assert_eq!(loaded, Ok(vec!["fresh".to_string()]));
    }

    #[tokio::test]
    async fn undecodable_entry_is_treated_as_miss_and_dropped() {
        let config = CacheConfig::default();
        let memory = Arc::new(MemoryBackend::new(&config));
        let backend: Arc<dyn CacheBackend> = memory.clone();
        let cache = QueryCache::new(Some(backend), config);

        memory
            .set(tags_key().as_str(), "not json".into(), Duration::from_secs(60))
            .await
            .expect("seed");

        assert_eq!(cache.get::<Vec<String>>(&tags_key()).await, None);
        assert!(memory.is_empty());
    }

    #[tokio::test]
    async fn disabled_cache_never_stores() {
        let cache = QueryCache::disabled();
        cache.put(&tags_key(), &vec!["a"]).await;
        assert!(!cache.is_enabled());
        assert_eq!(cache.get::<Vec<String>>(&tags_key()).await, None);
        assert_eq!(cache.invalidate_prefix("tags:").await.expect("noop"), 0);
    }
}
