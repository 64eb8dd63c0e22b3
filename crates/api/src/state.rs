//! Shared application state for the Axum API server.

use std::sync::Arc;

use sqlx::PgPool;

use courier_common::config::AppConfig;
use courier_engine::dispatch::Dispatcher;
use courier_realtime::registry::ConnectionRegistry;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: AppConfig,
    /// Live realtime connections of this instance.
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Dispatcher,
}

impl AppState {
    pub fn new(pool: PgPool, config: AppConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(
            config.realtime.registry_shards,
            config.realtime.outbound_buffer,
        ));
        let dispatcher = Dispatcher::new(pool.clone(), config.delivery.clone());

        Self {
            pool,
            config,
            registry,
            dispatcher,
        }
    }
}
