pub mod devices;
pub mod health;
pub mod ingest;
pub mod notifications;
pub mod preferences;
pub mod ws;

use axum::Router;

use crate::state::AppState;

/// Build the complete API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(ingest::router())
        .merge(notifications::router())
        .merge(preferences::router())
        .merge(devices::router())
        .merge(ws::router())
        .with_state(state)
}
