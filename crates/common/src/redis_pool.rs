use redis::Client;
use redis::aio::ConnectionManager;

/// Connect to Redis and verify the server answers before handing out the manager.
///
/// `ConnectionManager` reconnects on its own, so one instance is cloned into
/// every component that needs Redis.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let mut manager = ConnectionManager::new(client).await?;

    let _: String = redis::cmd("PING").query_async(&mut manager).await?;

    tracing::info!("Connected to Redis");
    Ok(manager)
}
