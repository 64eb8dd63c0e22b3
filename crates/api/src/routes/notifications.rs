//! Client notification routes. Read-state changes are pushed to the caller's
//! live realtime connections.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use courier_common::error::AppError;
use courier_engine::notifications::{
    ListFilter, Notification, NotificationService, PurgeOutcome, ReadAllUpdate,
};
use courier_realtime::protocol::ServerMessage;

use crate::middleware::auth::AuthUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/notifications", get(list_notifications))
        .route("/api/notifications/unread-count", get(unread_count))
        .route("/api/notifications/read-all", post(mark_all_read))
        .route(
            "/api/notifications/{id}",
            get(get_notification).delete(delete_notification),
        )
        .route("/api/notifications/{id}/read", post(mark_read))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub cursor: Option<String>,
    pub limit: Option<i64>,
    #[serde(default)]
    pub unread_only: bool,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub items: Vec<Notification>,
    pub next_cursor: Option<String>,
    pub unread_count: i64,
}

/// GET /api/notifications: One page, newest first, plus the unread count.
async fn list_notifications(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, AppError> {
    let filter = ListFilter {
        unread_only: query.unread_only,
        kind: query.kind,
    };
    let page = NotificationService::list(
        &state.pool,
        auth.recipient_id,
        &filter,
        query.cursor.as_deref(),
        query.limit,
    )
    .await?;
    let unread_count = NotificationService::unread_count(&state.pool, auth.recipient_id).await?;

    Ok(Json(ListResponse {
        items: page.items,
        next_cursor: page.next_cursor,
        unread_count,
    }))
}

/// GET /api/notifications/unread-count
async fn unread_count(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Value>, AppError> {
    let count = NotificationService::unread_count(&state.pool, auth.recipient_id).await?;
    Ok(Json(json!({ "unreadCount": count })))
}

/// GET /api/notifications/:id
async fn get_notification(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Notification>, AppError> {
    let notification = NotificationService::get(&state.pool, id, auth.recipient_id).await?;
    Ok(Json(notification))
}

/// POST /api/notifications/:id/read: Idempotent.
async fn mark_read(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let update = NotificationService::mark_read(&state.pool, id, auth.recipient_id).await?;

    if update.changed {
        state
            .registry
            .broadcast(auth.recipient_id, &ServerMessage::read(id, update.read_at));
    }
    state.registry.broadcast(
        auth.recipient_id,
        &ServerMessage::unread_count(update.unread_count),
    );

    Ok(Json(json!({ "unreadCount": update.unread_count })))
}

/// POST /api/notifications/read-all
async fn mark_all_read(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<ReadAllUpdate>, AppError> {
    let update = NotificationService::mark_all_read(&state.pool, auth.recipient_id).await?;

    state.registry.broadcast(
        auth.recipient_id,
        &ServerMessage::unread_count(update.unread_count),
    );

    Ok(Json(update))
}

/// DELETE /api/notifications/:id: Tombstone; idempotent.
async fn delete_notification(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<PurgeOutcome>, AppError> {
    let outcome = NotificationService::purge(&state.pool, id, auth.recipient_id).await?;

    if outcome.purged {
        state
            .registry
            .broadcast(auth.recipient_id, &ServerMessage::deleted(id));
        state.registry.broadcast(
            auth.recipient_id,
            &ServerMessage::unread_count(outcome.unread_count),
        );
    }

    Ok(Json(outcome))
}
