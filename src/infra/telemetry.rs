use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::broadcast::{
    METRIC_BACKLOG_LEN, METRIC_CONNECTIONS, METRIC_DELIVERIES, METRIC_DROPPED, METRIC_EVENTS,
    METRIC_MALFORMED,
};
use crate::cache::{
    METRIC_CACHE_ERROR, METRIC_CACHE_HIT, METRIC_CACHE_INVALIDATED, METRIC_CACHE_MISS,
    METRIC_CACHE_STALE_LOAD,
};
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the service emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_HIT,
            Unit::Count,
            "Query cache lookups served from the cache backend."
        );
        describe_counter!(
            METRIC_CACHE_MISS,
            Unit::Count,
            "Query cache lookups that fell through to the engagement store."
        );
        describe_counter!(
            METRIC_CACHE_ERROR,
            Unit::Count,
            "Cache backend operations that failed or timed out."
        );
        describe_counter!(
            METRIC_CACHE_INVALIDATED,
            Unit::Count,
            "Cache entries removed by write-driven invalidation."
        );
        describe_counter!(
            METRIC_CACHE_STALE_LOAD,
            Unit::Count,
            "Loaded results not cached because their family was invalidated mid-load."
        );
        describe_counter!(
            METRIC_EVENTS,
            Unit::Count,
            "Content events broadcast, labelled by kind."
        );
        describe_counter!(
            METRIC_DELIVERIES,
            Unit::Count,
            "Frames handed to client outbound queues."
        );
        describe_counter!(
            METRIC_DROPPED,
            Unit::Count,
            "Connections dropped because their queue was full or closed."
        );
        describe_counter!(
            METRIC_MALFORMED,
            Unit::Count,
            "Client frames that could not be parsed."
        );
        describe_gauge!(
            METRIC_CONNECTIONS,
            Unit::Count,
            "Currently registered live connections."
        );
        describe_gauge!(
            METRIC_BACKLOG_LEN,
            Unit::Count,
            "Events retained for replay to late subscribers."
        );
    });
}
