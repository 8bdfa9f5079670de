//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::BackendKind;
use crate::domain::heat::HeatWeights;

pub use cli::{CliArgs, Command, DatabaseOverride, MigrateArgs, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "emberfeed";
const ENV_PREFIX: &str = "EMBERFEED";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_CACHE_OP_TIMEOUT_MS: u64 = 250;
const DEFAULT_CACHE_MEMORY_CAPACITY: u64 = 1_000;
const DEFAULT_REDIS_RETRY_SECS: u64 = 5;
const DEFAULT_POSTS_TTL_SECS: u64 = 5 * 60;
const DEFAULT_TAGS_TTL_SECS: u64 = 60 * 60;
const DEFAULT_COMMENTS_TTL_SECS: u64 = 10 * 60;
const DEFAULT_TRENDING_TTL_SECS: u64 = 5 * 60;
const DEFAULT_BACKLOG_CAPACITY: u64 = 100;
const DEFAULT_BACKLOG_TTL_SECS: u64 = 5 * 60;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
const DEFAULT_HEARTBEAT_GRACE_SECS: u64 = 10;
const DEFAULT_OUTBOUND_QUEUE: u64 = 64;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
    pub heat: HeatWeights,
    pub broadcast: BroadcastSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    /// Engagement store location; `None` selects the in-memory store.
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub backend: BackendKind,
    pub redis_url: Option<String>,
    /// Minimum wait between attempts to reach an unreachable Redis.
    pub redis_retry: Duration,
    pub op_timeout: Duration,
    pub memory_capacity: NonZeroUsize,
    pub posts_ttl: Duration,
    pub tags_ttl: Duration,
    pub comments_ttl: Duration,
    pub trending_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    pub backlog_capacity: NonZeroUsize,
    pub backlog_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_grace: Duration,
    pub outbound_queue: NonZeroUsize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Migrate(args)) => raw.apply_database_override(&args.database),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    cache: RawCacheSettings,
    heat: RawHeatSettings,
    broadcast: RawBroadcastSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(backend) = overrides.cache_backend.as_ref() {
            self.cache.backend = Some(backend.clone());
        }
        if let Some(url) = overrides.cache_redis_url.as_ref() {
            self.cache.redis_url = Some(url.clone());
        }
        if let Some(capacity) = overrides.broadcast_backlog_capacity {
            self.broadcast.backlog_capacity = Some(capacity);
        }
        if let Some(seconds) = overrides.broadcast_heartbeat_seconds {
            self.broadcast.heartbeat_interval_seconds = Some(seconds);
        }

        self.apply_database_override(&DatabaseOverride {
            database_url: overrides.database_url.clone(),
        });
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            cache,
            heat,
            broadcast,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            cache: build_cache_settings(cache)?,
            heat: build_heat_weights(heat)?,
            broadcast: build_broadcast_settings(broadcast)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_shutdown = positive_secs(
        server.graceful_shutdown_seconds,
        DEFAULT_GRACEFUL_SHUTDOWN_SECS,
        "server.graceful_shutdown_seconds",
    )?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url: non_blank(database.url),
        max_connections,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let backend = match cache.backend.as_deref().map(str::trim) {
        None | Some("") => BackendKind::default(),
        Some(value) if value.eq_ignore_ascii_case("memory") => BackendKind::Memory,
        Some(value) if value.eq_ignore_ascii_case("redis") => BackendKind::Redis,
        Some(other) => {
            return Err(LoadError::invalid(
                "cache.backend",
                format!("unknown backend `{other}`, expected `memory` or `redis`"),
            ));
        }
    };

    let redis_url = non_blank(cache.redis_url);
    if backend == BackendKind::Redis && redis_url.is_none() {
        return Err(LoadError::invalid(
            "cache.redis_url",
            "required when cache.backend is `redis`",
        ));
    }

    let op_timeout_ms = cache.op_timeout_ms.unwrap_or(DEFAULT_CACHE_OP_TIMEOUT_MS);
    if op_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "cache.op_timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        backend,
        redis_url,
        redis_retry: positive_secs(
            cache.redis_retry_seconds,
            DEFAULT_REDIS_RETRY_SECS,
            "cache.redis_retry_seconds",
        )?,
        op_timeout: Duration::from_millis(op_timeout_ms),
        memory_capacity: non_zero_usize(
            cache
                .memory_capacity
                .unwrap_or(DEFAULT_CACHE_MEMORY_CAPACITY),
            "cache.memory_capacity",
        )?,
        posts_ttl: positive_secs(
            cache.posts_ttl_seconds,
            DEFAULT_POSTS_TTL_SECS,
            "cache.posts_ttl_seconds",
        )?,
        tags_ttl: positive_secs(
            cache.tags_ttl_seconds,
            DEFAULT_TAGS_TTL_SECS,
            "cache.tags_ttl_seconds",
        )?,
        comments_ttl: positive_secs(
            cache.comments_ttl_seconds,
            DEFAULT_COMMENTS_TTL_SECS,
            "cache.comments_ttl_seconds",
        )?,
        trending_ttl: positive_secs(
            cache.trending_ttl_seconds,
            DEFAULT_TRENDING_TTL_SECS,
            "cache.trending_ttl_seconds",
        )?,
    })
}

fn build_heat_weights(heat: RawHeatSettings) -> Result<HeatWeights, LoadError> {
    let defaults = HeatWeights::default();

    let like_weight = non_negative(heat.like_weight, defaults.like_weight, "heat.like_weight")?;
    let comment_weight = non_negative(
        heat.comment_weight,
        defaults.comment_weight,
        "heat.comment_weight",
    )?;
    let decay_rate = non_negative(heat.decay_rate, defaults.decay_rate, "heat.decay_rate")?;
    let boost_multiplier = non_negative(
        heat.boost_multiplier,
        defaults.boost_multiplier,
        "heat.boost_multiplier",
    )?;

    let boost_window = match heat.boost_window_hours {
        Some(hours) => {
            let hours = i64::try_from(hours).map_err(|_| {
                LoadError::invalid("heat.boost_window_hours", "value exceeds supported range")
            })?;
            time::Duration::hours(hours)
        }
        None => defaults.boost_window,
    };

    Ok(HeatWeights {
        like_weight,
        comment_weight,
        decay_rate,
        boost_window,
        boost_multiplier,
    })
}

fn build_broadcast_settings(
    broadcast: RawBroadcastSettings,
) -> Result<BroadcastSettings, LoadError> {
    Ok(BroadcastSettings {
        backlog_capacity: non_zero_usize(
            broadcast
                .backlog_capacity
                .unwrap_or(DEFAULT_BACKLOG_CAPACITY),
            "broadcast.backlog_capacity",
        )?,
        backlog_ttl: positive_secs(
            broadcast.backlog_ttl_seconds,
            DEFAULT_BACKLOG_TTL_SECS,
            "broadcast.backlog_ttl_seconds",
        )?,
        heartbeat_interval: positive_secs(
            broadcast.heartbeat_interval_seconds,
            DEFAULT_HEARTBEAT_INTERVAL_SECS,
            "broadcast.heartbeat_interval_seconds",
        )?,
        heartbeat_grace: Duration::from_secs(
            broadcast
                .heartbeat_grace_seconds
                .unwrap_or(DEFAULT_HEARTBEAT_GRACE_SECS),
        ),
        outbound_queue: non_zero_usize(
            broadcast.outbound_queue.unwrap_or(DEFAULT_OUTBOUND_QUEUE),
            "broadcast.outbound_queue",
        )?,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    backend: Option<String>,
    redis_url: Option<String>,
    redis_retry_seconds: Option<u64>,
    op_timeout_ms: Option<u64>,
    memory_capacity: Option<u64>,
    posts_ttl_seconds: Option<u64>,
    tags_ttl_seconds: Option<u64>,
    comments_ttl_seconds: Option<u64>,
    trending_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawHeatSettings {
    like_weight: Option<f64>,
    comment_weight: Option<f64>,
    decay_rate: Option<f64>,
    boost_window_hours: Option<u64>,
    boost_multiplier: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBroadcastSettings {
    backlog_capacity: Option<u64>,
    backlog_ttl_seconds: Option<u64>,
    heartbeat_interval_seconds: Option<u64>,
    heartbeat_grace_seconds: Option<u64>,
    outbound_queue: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn positive_secs(value: Option<u64>, default: u64, key: &'static str) -> Result<Duration, LoadError> {
    match value.unwrap_or(default) {
        0 => Err(LoadError::invalid(key, "must be greater than zero")),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn non_negative(value: Option<f64>, default: f64, key: &'static str) -> Result<f64, LoadError> {
    let value = value.unwrap_or(default);
    if !value.is_finite() || value < 0.0 {
        return Err(LoadError::invalid(
            key,
            format!("must be a finite non-negative number, got {value}"),
        ));
    }
    Ok(value)
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[cfg(test)]
mod tests;
