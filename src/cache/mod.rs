//! Query cache for feed reads.
//!
//! Results of paginated listings, tag enumeration, comment lists and trending
//! rankings are cached under family-prefixed keys with per-family TTLs. Writes
//! drop the affected families synchronously before they are broadcast, and a
//! per-family generation keeps loads that overlapped a write out of the cache.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! backend = "memory"   # or "redis"
//! redis_url = "redis://127.0.0.1/"
//! op_timeout_ms = 250
//! posts_ttl_seconds = 300
//! ```

mod config;
mod invalidation;
mod keys;
mod query_cache;
mod redis_store;
mod store;

pub use config::{BackendKind, CacheConfig, FamilyTtls};
pub use invalidation::{InvalidationOutcome, InvalidationPlan, WriteKind};
pub use keys::{CacheKey, KeyFamily};
pub use query_cache::QueryCache;
pub use redis_store::RedisBackend;
pub use store::{CacheBackend, CacheError, MemoryBackend};

pub(crate) use query_cache::{
    METRIC_CACHE_ERROR, METRIC_CACHE_HIT, METRIC_CACHE_INVALIDATED, METRIC_CACHE_MISS,
    METRIC_CACHE_STALE_LOAD,
};
