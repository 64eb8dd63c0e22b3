//! Device token registration for push delivery.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, post};
use axum::{Json, Router};
use serde::Deserialize;

use courier_common::error::AppError;
use courier_common::types::{DeviceToken, Platform};
use courier_engine::devices::DeviceTokenService;

use crate::middleware::auth::AuthUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/devices", post(register_device))
        .route("/api/devices/{token}", delete(unregister_device))
}

#[derive(Debug, Deserialize)]
pub struct RegisterDeviceRequest {
    pub platform: Platform,
    pub token: String,
}

/// POST /api/devices: Register (or move) a device token.
async fn register_device(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(request): Json<RegisterDeviceRequest>,
) -> Result<(StatusCode, Json<DeviceToken>), AppError> {
    let device = DeviceTokenService::register(
        &state.pool,
        auth.recipient_id,
        request.platform,
        &request.token,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(device)))
}

/// DELETE /api/devices/:token: Unregister one of the caller's tokens.
async fn unregister_device(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(token): Path<String>,
) -> Result<StatusCode, AppError> {
    if DeviceTokenService::unregister(&state.pool, auth.recipient_id, &token).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("Device token not registered".to_string()))
    }
}
