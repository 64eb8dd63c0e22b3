//! Ingestion endpoint for upstream event producers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::payload::NotificationKind;
use courier_common::types::Channel;

use crate::middleware::producer::Producer;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/ingest/notifications", post(create_notification))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    pub recipient_id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub channels: Vec<String>,
}

impl IngestRequest {
    fn channels(&self) -> Result<Vec<Channel>, AppError> {
        self.channels
            .iter()
            .map(|c| c.parse::<Channel>().map_err(AppError::Validation))
            .collect()
    }
}

/// POST /api/ingest/notifications: Persist and dispatch a notification.
async fn create_notification(
    State(state): State<AppState>,
    _producer: Producer,
    Json(request): Json<IngestRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let kind = NotificationKind::parse(&request.kind, request.payload.clone())?;
    let channels = request.channels()?;

    let notification = state
        .dispatcher
        .ingest(request.recipient_id, &kind, &channels)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "notificationId": notification.id })),
    ))
}
