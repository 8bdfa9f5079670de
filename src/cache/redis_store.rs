//! Redis-backed cache store shared between instances.
//!
//! The managed connection is opened on first use. While Redis is unreachable
//! every operation fails fast with [`CacheError::Disconnected`] and a new
//! connection attempt is made at most once per retry interval, so the cache
//! comes back on its own once Redis does.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, Client, RedisError, aio::ConnectionManager};
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::store::{CacheBackend, CacheError};
use crate::util::lock::mutex_lock;

const BACKEND: &str = "redis";
const SOURCE: &str = "cache::redis_store";
const SCAN_BATCH: usize = 200;
const GENERATION_PREFIX: &str = "gen:";

pub struct RedisBackend {
    client: Client,
    connect_timeout: Duration,
    retry_interval: Duration,
    connection: OnceCell<ConnectionManager>,
    /// Earliest instant of the next connection attempt after a failure.
    next_attempt: Mutex<Option<Instant>>,
}

impl RedisBackend {
    /// Prepare a backend for `url` without connecting.
    pub fn new(
        url: &str,
        connect_timeout: Duration,
        retry_interval: Duration,
    ) -> Result<Self, CacheError> {
        let client = Client::open(url).map_err(redis_error)?;
        Ok(Self {
            client,
            connect_timeout,
            retry_interval,
            connection: OnceCell::new(),
            next_attempt: Mutex::new(None),
        })
    }

    /// Try to connect now instead of on first use.
    pub async fn connect(&self) -> Result<(), CacheError> {
        self.manager().await.map(|_| ())
    }

    pub fn is_connected(&self) -> bool {
        self.connection.initialized()
    }

    async fn manager(&self) -> Result<ConnectionManager, CacheError> {
        if let Some(connection) = self.connection.get() {
            return Ok(connection.clone());
        }

        let next_attempt = *mutex_lock(&self.next_attempt, SOURCE, "manager");
        if let Some(at) = next_attempt {
            let now = Instant::now();
            if now < at {
                return Err(CacheError::Disconnected {
                    backend: BACKEND,
                    retry_in: at - now,
                });
            }
        }

        match self.connection.get_or_try_init(|| self.open()).await {
            Ok(connection) => {
                *mutex_lock(&self.next_attempt, SOURCE, "manager") = None;
                Ok(connection.clone())
            }
            Err(err) => {
                *mutex_lock(&self.next_attempt, SOURCE, "manager") =
                    Some(Instant::now() + self.retry_interval);
                warn!(
                    backend = BACKEND,
                    error = %err,
                    retry_seconds = self.retry_interval.as_secs(),
                    "Cache backend unreachable"
                );
                Err(err)
            }
        }
    }

    async fn open(&self) -> Result<ConnectionManager, CacheError> {
        let timeout = self.connect_timeout;
        let connection = tokio::time::timeout(timeout, self.client.get_connection_manager())
            .await
            .map_err(|_| CacheError::Timeout {
                backend: BACKEND,
                timeout,
            })?
            .map_err(redis_error)?;
        info!(backend = BACKEND, "Cache backend connected");
        Ok(connection)
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.manager().await?;
        conn.get(key).await.map_err(redis_error)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.manager().await?;
        let seconds = ttl.as_secs().max(1);
        let _: () = conn.set_ex(key, value, seconds).await.map_err(redis_error)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.manager().await?;
        let removed: u64 = conn.del(key).await.map_err(redis_error)?;
        Ok(removed > 0)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut conn = self.manager().await?;
        let pattern = format!("{}*", escape_glob(prefix));
        let mut cursor: u64 = 0;
        let mut removed = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(redis_error)?;

            if !keys.is_empty() {
                let deleted: u64 = conn.del(&keys).await.map_err(redis_error)?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(
            backend = BACKEND,
            prefix,
            removed,
            "Deleted keys by prefix"
        );
        Ok(removed)
    }

    async fn generation(&self, scope: &str) -> Result<u64, CacheError> {
        let mut conn = self.manager().await?;
        let generation: Option<u64> = conn
            .get(generation_key(scope))
            .await
            .map_err(redis_error)?;
        Ok(generation.unwrap_or(0))
    }

    async fn bump_generation(&self, scope: &str) -> Result<u64, CacheError> {
        let mut conn = self.manager().await?;
        conn.incr(generation_key(scope), 1u64)
            .await
            .map_err(redis_error)
    }
}

/// Generation counters live outside every family prefix so prefix deletes
/// never reset them.
fn generation_key(scope: &str) -> String {
    format!("{GENERATION_PREFIX}{scope}")
}

fn redis_error(err: RedisError) -> CacheError {
    CacheError::backend(BACKEND, err.to_string())
}

/// Escape redis glob metacharacters so a prefix matches literally.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for ch in prefix.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\' | '^') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
