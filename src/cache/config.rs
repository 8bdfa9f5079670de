//! Query cache configuration.
//!
//! Controls the backend selection and per-family TTLs via `emberfeed.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

use super::keys::KeyFamily;

const DEFAULT_MEMORY_CAPACITY: usize = 1_000;
const DEFAULT_OP_TIMEOUT_MS: u64 = 250;
const DEFAULT_REDIS_RETRY_SECS: u64 = 5;
const DEFAULT_POSTS_TTL_SECS: u64 = 5 * 60;
const DEFAULT_TAGS_TTL_SECS: u64 = 60 * 60;
const DEFAULT_COMMENTS_TTL_SECS: u64 = 10 * 60;
const DEFAULT_TRENDING_TTL_SECS: u64 = 5 * 60;

/// Which store holds cached query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Redis,
}

/// Time-to-live per key family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyTtls {
    pub posts: Duration,
    pub tags: Duration,
    pub comments: Duration,
    pub trending: Duration,
}

impl Default for FamilyTtls {
    fn default() -> Self {
        Self {
            posts: Duration::from_secs(DEFAULT_POSTS_TTL_SECS),
            tags: Duration::from_secs(DEFAULT_TAGS_TTL_SECS),
            comments: Duration::from_secs(DEFAULT_COMMENTS_TTL_SECS),
            trending: Duration::from_secs(DEFAULT_TRENDING_TTL_SECS),
        }
    }
}

impl FamilyTtls {
    pub fn for_family(&self, family: KeyFamily) -> Duration {
        match family {
            KeyFamily::Posts => self.posts,
            KeyFamily::Tags => self.tags,
            KeyFamily::Comments => self.comments,
            KeyFamily::Trending => self.trending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// When false every read goes straight to the engagement store.
    pub enabled: bool,
    pub backend: BackendKind,
    pub redis_url: Option<String>,
    /// Minimum wait between attempts to reach an unreachable Redis.
    pub redis_retry: Duration,
    /// Upper bound for a single backend round trip before falling back.
    pub op_timeout: Duration,
    /// Maximum entries held by the in-process backend.
    pub memory_capacity: NonZeroUsize,
    pub ttls: FamilyTtls,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: BackendKind::Memory,
            redis_url: None,
            redis_retry: Duration::from_secs(DEFAULT_REDIS_RETRY_SECS),
            op_timeout: Duration::from_millis(DEFAULT_OP_TIMEOUT_MS),
            memory_capacity: NonZeroUsize::new(DEFAULT_MEMORY_CAPACITY)
                .unwrap_or(NonZeroUsize::MIN),
            ttls: FamilyTtls::default(),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            backend: settings.backend,
            redis_url: settings.redis_url.clone(),
            redis_retry: settings.redis_retry,
            op_timeout: settings.op_timeout,
            memory_capacity: settings.memory_capacity,
            ttls: FamilyTtls {
                posts: settings.posts_ttl,
                tags: settings.tags_ttl,
                comments: settings.comments_ttl,
                trending: settings.trending_ttl,
            },
        }
    }
}
