use tokio_util::sync::CancellationToken;

use courier_common::config::AppConfig;
use courier_common::{db, redis_pool};
use courier_engine::dispatch::Dispatcher;
use courier_notifier::{Sweeper, external_adapters, spawn_workers};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_notifier=info,courier_engine=info".into()),
        )
        .json()
        .init();

    tracing::info!("Courier delivery worker starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;
    let redis = redis_pool::create_redis_pool(&config.redis_url).await?;

    // Realtime delivery needs the connection registry, so that partition runs
    // inside the API process.
    let adapters = external_adapters(&pool, &redis, &config);
    if adapters.is_empty() {
        anyhow::bail!("no external channel is configured; nothing to deliver");
    }

    let cancel = CancellationToken::new();
    let mut handles = spawn_workers(&pool, adapters, &config.delivery, &cancel);

    let sweeper = Sweeper::new(
        Dispatcher::new(pool.clone(), config.delivery.clone()),
        config.delivery.clone(),
    );
    let sweeper_cancel = cancel.clone();
    handles.push(tokio::spawn(async move { sweeper.run(sweeper_cancel).await }));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, draining in-flight jobs...");
    cancel.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }

    tracing::info!("Courier delivery worker stopped.");
    Ok(())
}
