use std::{future::IntoFuture, process, sync::Arc};

use emberfeed::{
    application::{error::AppError, feed::FeedService, repos::EngagementStore},
    broadcast::{BroadcastConfig, Broadcaster},
    cache::{BackendKind, CacheBackend, CacheConfig, QueryCache, RedisBackend},
    config,
    domain::heat::HeatScorer,
    infra::{
        db::PostgresEngagementStore,
        error::InfraError,
        http::{self, HttpState},
        memory::InMemoryEngagementStore,
        telemetry,
    },
};
use tokio::sync::Notify;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Migrate(_) => run_migrate(settings).await,
    }
}

async fn run_migrate(settings: config::Settings) -> Result<(), AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))?;

    let max_connections = settings.database.max_connections.get();
    let pool = PostgresEngagementStore::connect(database_url, max_connections)
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;
    PostgresEngagementStore::run_migrations(&pool)
        .await
        .map_err(InfraError::from)?;

    info!("Database migrations applied");
    Ok(())
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let (store, db) = init_store(&settings).await?;
    let cache = init_cache(&settings).await;

    let broadcaster = Arc::new(Broadcaster::new(BroadcastConfig::from(&settings.broadcast)));
    let heartbeat = broadcaster.spawn_heartbeat();

    let feed = FeedService::new(
        store,
        cache,
        Arc::clone(&broadcaster),
        HeatScorer::new(settings.heat),
    );

    let result = serve_http(&settings, HttpState { feed, db }).await;

    heartbeat.abort();
    let _ = heartbeat.await;

    result
}

async fn init_store(
    settings: &config::Settings,
) -> Result<(Arc<dyn EngagementStore>, Option<PostgresEngagementStore>), AppError> {
    let Some(database_url) = settings.database.url.as_ref() else {
        warn!("No database url configured; using the in-memory engagement store");
        return Ok((Arc::new(InMemoryEngagementStore::new()), None));
    };

    let max_connections = settings.database.max_connections.get();
    let pool = PostgresEngagementStore::connect(database_url, max_connections)
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    PostgresEngagementStore::run_migrations(&pool)
        .await
        .map_err(InfraError::from)?;

    let store = PostgresEngagementStore::new(pool);
    info!(max_connections, "Connected to Postgres engagement store");
    Ok((Arc::new(store.clone()), Some(store)))
}

async fn init_cache(settings: &config::Settings) -> QueryCache {
    let config = CacheConfig::from(&settings.cache);
    if !config.enabled {
        info!("Query cache disabled");
        return QueryCache::disabled();
    }

    match (config.backend, config.redis_url.clone()) {
        (BackendKind::Redis, Some(url)) => {
            match RedisBackend::new(&url, config.op_timeout, config.redis_retry) {
                Ok(backend) => {
                    if let Err(err) = backend.connect().await {
                        warn!(
                            error = %err,
                            retry_seconds = config.redis_retry.as_secs(),
                            "Redis unavailable at startup; reads bypass the cache until it returns"
                        );
                    }
                    let backend: Arc<dyn CacheBackend> = Arc::new(backend);
                    QueryCache::new(Some(backend), config)
                }
                Err(err) => {
                    warn!(error = %err, "Invalid redis url; serving reads without a cache");
                    QueryCache::new(None, config)
                }
            }
        }
        _ => QueryCache::in_memory(config),
    }
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);
    let addr = settings.server.addr;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| AppError::from(InfraError::Bind { addr, source }))?;
    info!(addr = %addr, "Listening");

    let grace = settings.server.graceful_shutdown;
    let shutdown = Arc::new(Notify::new());
    let signal = Arc::clone(&shutdown);
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signal.notify_waiters();
        })
        .into_future();

    // Open WebSocket connections would otherwise hold shutdown forever.
    let drain_deadline = async {
        shutdown.notified().await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = server => result.map_err(|err| AppError::from(InfraError::from(err)))?,
        () = drain_deadline => warn!(
            grace_seconds = grace.as_secs(),
            "Graceful shutdown timed out; dropping open connections"
        ),
    }

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
