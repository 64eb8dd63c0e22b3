//! Realtime WebSocket endpoint.
//!
//! The socket is authenticated from the `token` query parameter, then driven
//! by a [`Session`] until the client leaves, goes idle, overflows its
//! outbound buffer, or the server shuts down.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use courier_common::error::AppError;
use courier_realtime::protocol::{CLOSE_BAD_REQUEST, CLOSE_GOING_AWAY, ServerMessage};
use courier_realtime::registry::CloseReason;
use courier_realtime::session::{Close, Session};

use crate::middleware::auth::authenticate;
use crate::state::AppState;

/// Server ping cadence; idle detection runs on the same tick.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

type WsSender = SplitSink<WebSocket, Message>;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// GET /ws?token=<JWT>: Upgrade to the realtime protocol.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, query.token, state))
}

async fn handle_socket(socket: WebSocket, token: Option<String>, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut session = Session::new(state.pool.clone(), state.registry.clone());

    let identity = token
        .ok_or_else(|| AppError::Auth("Missing token".to_string()))
        .and_then(|token| authenticate(&token, &state.config.jwt_secret))
        .map(|(recipient_id, _)| recipient_id);
    if let Err(close) = session.authenticate(identity) {
        send_close(&mut sender, close).await;
        return;
    }

    let (mut registration, initial) = match session.activate().await {
        Ok(activated) => activated,
        Err(close) => {
            send_close(&mut sender, close).await;
            return;
        }
    };
    if send(&mut sender, &initial).await.is_err() {
        return;
    }

    let idle_timeout = state.config.realtime.idle_timeout();
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
        HEARTBEAT_INTERVAL,
    );

    let close = loop {
        tokio::select! {
            _ = registration.closed.cancelled() => {
                let reason = registration.close_reason().unwrap_or(CloseReason::Shutdown);
                break Some(close_for(reason.code(), reason.message()));
            }
            event = registration.events.recv() => match event {
                Some(message) => {
                    if send(&mut sender, &message).await.is_err() {
                        break None;
                    }
                }
                None => break None,
            },
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => match session.handle_text(text.as_str()).await {
                    Ok(replies) => {
                        if send_all(&mut sender, &replies).await.is_err() {
                            break None;
                        }
                    }
                    Err(close) => break Some(close),
                },
                Some(Ok(Message::Binary(_))) => {
                    break Some(close_for(CLOSE_BAD_REQUEST, "binary frames are not supported"));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => session.touch(),
                Some(Ok(Message::Close(_))) | None => break None,
                Some(Err(e)) => {
                    tracing::debug!(
                        connection_id = ?session.connection_id(),
                        error = %e,
                        "WebSocket error"
                    );
                    break None;
                }
            },
            _ = heartbeat.tick() => {
                if session.idle_for() >= idle_timeout {
                    break Some(close_for(CLOSE_GOING_AWAY, "idle timeout"));
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break None;
                }
            }
        }
    };

    session.close();
    if let Some(close) = close {
        send_close(&mut sender, close).await;
    }
}

fn close_for(code: u16, reason: &str) -> Close {
    Close {
        code,
        reason: reason.to_string(),
        notice: None,
    }
}

async fn send(sender: &mut WsSender, message: &ServerMessage) -> Result<(), axum::Error> {
    match message.to_json() {
        Ok(json) => sender.send(Message::Text(json.into())).await,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize server message");
            Ok(())
        }
    }
}

async fn send_all(sender: &mut WsSender, messages: &[ServerMessage]) -> Result<(), axum::Error> {
    for message in messages {
        send(sender, message).await?;
    }
    Ok(())
}

async fn send_close(sender: &mut WsSender, close: Close) {
    if let Some(notice) = &close.notice {
        let _ = send(sender, notice).await;
    }

    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: close.code,
            reason: close.reason.into(),
        })))
        .await;
}
