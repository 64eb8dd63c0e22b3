//! Courier API server binary entrypoint.
//!
//! Serves HTTP and WebSocket traffic and runs every delivery partition
//! in-process; the realtime partition needs this instance's connection
//! registry.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use courier_common::config::AppConfig;
use courier_common::db::{create_pool, run_migrations};
use courier_common::redis_pool::create_redis_pool;
use courier_notifier::realtime::RealtimeAdapter;
use courier_notifier::{ChannelAdapter, Sweeper, external_adapters, spawn_workers};

use courier_api::routes::create_router;
use courier_api::state::AppState;

const MAX_BODY_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(
                "courier_api=debug,courier_engine=debug,courier_realtime=debug,\
                 courier_notifier=info,tower_http=debug",
            )
        }))
        .init();

    tracing::info!("Starting Courier API server...");

    let config = AppConfig::from_env()?;

    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;
    let redis = create_redis_pool(&config.redis_url).await?;

    let state = AppState::new(pool.clone(), config.clone());
    let cancel = CancellationToken::new();

    let mut adapters: Vec<Arc<dyn ChannelAdapter>> = vec![Arc::new(RealtimeAdapter::new(
        pool.clone(),
        state.registry.clone(),
    ))];
    adapters.extend(external_adapters(&pool, &redis, &config));
    let mut workers = spawn_workers(&pool, adapters, &config.delivery, &cancel);

    let sweeper = Sweeper::new(state.dispatcher.clone(), config.delivery.clone());
    let sweeper_cancel = cancel.clone();
    workers.push(tokio::spawn(async move { sweeper.run(sweeper_cancel).await }));

    let app = create_router(state.clone())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.api_bind_addr).await?;
    tracing::info!("API server listening on {}", config.api_bind_addr);

    let registry = state.registry.clone();
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Received shutdown signal, stopping gracefully...");
            shutdown.cancel();
            registry.close_all();
        })
        .await?;

    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "Background task panicked");
        }
    }

    tracing::info!("Courier API server stopped.");
    Ok(())
}
