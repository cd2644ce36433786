//! Courier webhook transmission service.
//!
//! Main entry point. Initializes all subsystems and coordinates graceful
//! startup and shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier::{
    config::{Config, LogFormat},
    limiter,
    server::{self, AppState},
};
use courier_core::{storage::schema, Clock, NoOpEventHandler, RealClock, Storage};
use courier_delivery::{
    enrichment::{
        EnrichmentAdapter, EnrichmentCache, HttpLearningTimeSource, InMemoryEnrichmentCache,
        RedisEnrichmentCache,
    },
    ingest::{CompletionHandler, EnrollmentHandler, EventDispatcher},
    router::Router,
    storage::{DeliveryStorage, PostgresDeliveryStorage},
    DeliveryEngine,
};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const INTAKE_CAPACITY: usize = 1024;
const REDIS_CONNECT_RETRIES: u32 = 5;
const REDIS_RETRY_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config)?;

    info!("Starting courier webhook transmission service");
    info!(
        database_url = %config.database_url_masked(),
        redis_url = config.redis_url_masked().as_deref().unwrap_or("none"),
        workers = config.worker_pool_size,
        enrichment = config.enrichment_enabled,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    schema::apply(&db_pool).await.context("Failed to apply database schema")?;
    info!("Database schema ready");

    courier_delivery::metrics::describe_all();

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let storage: Arc<dyn DeliveryStorage> =
        Arc::new(PostgresDeliveryStorage::new(Arc::new(Storage::new(db_pool.clone()))));

    let rate_limiter =
        limiter::create_rate_limiter(&config, REDIS_CONNECT_RETRIES, REDIS_RETRY_DELAY).await?;
    let enrichment = create_enrichment_adapter(&config, clock.clone()).await?;

    let mut engine = DeliveryEngine::with_components(
        storage.clone(),
        config.to_delivery_config(),
        rate_limiter,
        clock.clone(),
        Arc::new(NoOpEventHandler),
    )
    .context("Failed to build delivery engine")?;
    engine.start().await.context("Failed to start delivery engine")?;

    let router = Arc::new(Router::new(storage.clone(), clock.clone()));
    let mut dispatcher = EventDispatcher::new();
    dispatcher.register(Arc::new(CompletionHandler::new(router.clone(), enrichment)));
    dispatcher.register(Arc::new(EnrollmentHandler::new(router)));

    let shutdown = CancellationToken::new();
    let (intake_tx, intake_rx) = mpsc::channel(INTAKE_CAPACITY);
    let consumer = tokio::spawn(Arc::new(dispatcher).run(intake_rx, shutdown.child_token()));

    let state = AppState::new(storage, engine.stats_handle(), clock).with_intake(intake_tx);
    let app = server::create_router(state, Duration::from_secs(config.request_timeout));
    let addr = config.parse_server_addr()?;
    let server_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = server::start_server(app, addr, shutdown).await {
                error!(error = %e, "Health server failed");
            }
        }
    });

    info!(addr = %addr, "Courier is ready");

    server::shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    shutdown.cancel();
    if let Err(e) = server_handle.await {
        warn!(error = %e, "Health server task ended abnormally");
    }
    if let Err(e) = consumer.await {
        warn!(error = %e, "Event consumer task ended abnormally");
    }
    if let Err(e) = engine.shutdown().await {
        warn!(error = %e, "Delivery engine did not stop cleanly");
    }

    db_pool.close().await;
    info!("Database connections closed");

    info!("Courier shutdown complete");
    Ok(())
}

/// Installs the tracing subscriber.
///
/// `RUST_LOG` set in the environment wins over the configured filter.
fn init_tracing(config: &Config) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.rust_log))
        .context("Invalid log filter")?;

    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .try_init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_thread_ids(true).with_line_number(true))
            .try_init(),
    }
    .context("Failed to install tracing subscriber")
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;
    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(config.database_idle_timeout))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

async fn create_enrichment_adapter(config: &Config, clock: Arc<dyn Clock>) -> Result<EnrichmentAdapter> {
    let enrichment_config = config.to_enrichment_config();
    let Some(source_url) = enrichment_config.source_url.clone().filter(|_| enrichment_config.enabled) else {
        info!("Enrichment disabled");
        return Ok(EnrichmentAdapter::disabled());
    };

    let source = HttpLearningTimeSource::new(
        source_url,
        enrichment_config.source_token.clone(),
        enrichment_config.lookup_timeout,
    )
    .context("Failed to build enrichment source")?;

    let cache: Arc<dyn EnrichmentCache> = match config.redis_url.as_deref() {
        Some(url) => match RedisEnrichmentCache::connect(url).await {
            Ok(cache) => Arc::new(cache),
            Err(e) => {
                warn!(error = %e, "Redis unavailable, using in-process enrichment cache");
                Arc::new(InMemoryEnrichmentCache::with_clock(clock))
            },
        },
        None => Arc::new(InMemoryEnrichmentCache::with_clock(clock)),
    };

    info!("Enrichment enabled");
    Ok(EnrichmentAdapter::new(enrichment_config, Arc::new(source), cache))
}
