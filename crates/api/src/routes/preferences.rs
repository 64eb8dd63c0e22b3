//! Per-recipient delivery preferences.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use courier_common::error::AppError;
use courier_engine::preferences::{Preference, PreferenceService, PreferenceUpdate};

use crate::middleware::auth::AuthUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/preferences", get(get_preferences).put(update_preferences))
}

/// GET /api/preferences: Stored preferences, or the defaults.
async fn get_preferences(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Preference>, AppError> {
    let preference = PreferenceService::get(&state.pool, auth.recipient_id).await?;
    Ok(Json(preference))
}

/// PUT /api/preferences: Merge a partial update; omitted keys are kept.
async fn update_preferences(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(update): Json<PreferenceUpdate>,
) -> Result<Json<Preference>, AppError> {
    let preference = PreferenceService::update(&state.pool, auth.recipient_id, &update).await?;
    Ok(Json(preference))
}
