use anyhow::Context;
use iotflow::cache::{CacheBackend, InMemoryCache, RedisCache};
use iotflow::clock::{Clock, SystemClock};
use iotflow::config::{CacheTier, Config};
use iotflow::store::PgStore;
use iotflow::{metrics, rest, ServiceSettings, TelemetryService};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    info!("Starting iotflow");
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.database_url.split('@').last().unwrap_or("***"));
    info!(
        "Offline threshold {}s, cache TTL {}s, sync every {}s (enabled: {})",
        config.offline_threshold_secs,
        config.cache_ttl_secs,
        config.sync_interval_secs,
        config.sync_enabled
    );

    metrics::init_metrics().context("failed to register metrics")?;

    let store = Arc::new(
        PgStore::connect(
            &config.database_url,
            config.db_max_connections,
            config.store_timeout(),
        )
        .await
        .context("failed to connect to database")?,
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache_backend: Option<Arc<dyn CacheBackend>> = match &config.cache_tier {
        CacheTier::Redis(url) => match RedisCache::connect(url, config.store_timeout()).await {
            Ok(redis) => Some(Arc::new(redis)),
            Err(e) => {
                // Liveness falls back to the durable store until restart.
                warn!("Redis unavailable ({}), running with the cache tier disabled", e);
                None
            }
        },
        CacheTier::InProcess => {
            info!("No REDIS_URL set, using the in-process liveness cache");
            Some(Arc::new(InMemoryCache::new(clock.clone())))
        }
        CacheTier::Disabled => {
            info!("Liveness cache tier disabled");
            None
        }
    };

    let service = Arc::new(TelemetryService::new(
        store.clone(),
        store,
        cache_backend,
        clock,
        ServiceSettings {
            cache: config.cache_settings(),
            max_range_limit: config.max_range_limit,
            sync_enabled: config.sync_enabled,
        },
    ));

    if config.admin_token.is_none() {
        warn!("ADMIN_TOKEN not set, admin endpoints are disabled");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler_handle = tokio::spawn(
        service
            .reconciler()
            .run_periodic(config.sync_interval(), shutdown_rx),
    );

    let app = rest::create_router(service, config.admin_token.clone());
    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.http_addr))?;

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = reconciler_handle.await {
        error!("Reconciler task failed: {}", e);
    }

    info!("Shutting down");
    Ok(())
}
