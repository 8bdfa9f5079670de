//! Cache storage backends.
//!
//! Backends store opaque serialized values with a TTL. The in-process backend
//! bounds memory with LRU eviction; the Redis backend lives in `redis_store.rs`.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use lru::LruCache;
use thiserror::Error;
use tokio::time::Instant;

use super::config::CacheConfig;
use crate::util::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend `{backend}` timed out after {timeout:?}")]
    Timeout {
        backend: &'static str,
        timeout: Duration,
    },
    #[error("cache backend `{backend}` failed: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },
    #[error("cache backend `{backend}` is not connected; next attempt in {retry_in:?}")]
    Disconnected {
        backend: &'static str,
        retry_in: Duration,
    },
    #[error("cached value could not be encoded or decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

impl CacheError {
    pub fn backend(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            message: message.into(),
        }
    }
}

/// Key-value store with per-entry expiry.
///
/// Implementations never return an entry past its expiry. Besides entries,
/// a backend keeps a write generation per scope (a key family prefix) that
/// only ever moves forward; it is shared by every process using the backend.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Remove `key`, returning whether it was present.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Remove every key starting with `prefix`, returning how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError>;

    /// Current generation of `scope`; zero until first bumped.
    async fn generation(&self, scope: &str) -> Result<u64, CacheError>;

    /// Advance the generation of `scope`, returning the new value.
    async fn bump_generation(&self, scope: &str) -> Result<u64, CacheError>;
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process TTL + LRU backend.
pub struct MemoryBackend {
    entries: RwLock<LruCache<String, Entry>>,
    generations: DashMap<String, u64>,
}

impl MemoryBackend {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(config.memory_capacity)),
            generations: DashMap::new(),
        }
    }

    /// Number of entries held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = rw_write(&self.entries, SOURCE, "get");
        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Ok(Some(entry.value.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        rw_write(&self.entries, SOURCE, "set").put(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(rw_write(&self.entries, SOURCE, "delete").pop(key).is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut entries = rw_write(&self.entries, SOURCE, "delete_prefix");
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        Ok(doomed.len() as u64)
    }

    async fn generation(&self, scope: &str) -> Result<u64, CacheError> {
        Ok(self.generations.get(scope).map(|entry| *entry).unwrap_or(0))
    }

    async fn bump_generation(&self, scope: &str) -> Result<u64, CacheError> {
        let mut entry = self.generations.entry(scope.to_string()).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }
}
