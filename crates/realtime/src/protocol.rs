//! Realtime wire protocol: JSON text frames in both directions.
//!
//! Server frames carry an `event` tag, client frames an `action` tag. Replies
//! to a client action echo its `correlationId`; pushes caused by other
//! sessions or by the delivery pipeline carry none.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use courier_common::error::AppError;
use courier_engine::notifications::{Notification, Page};

/// Close code for a missing or invalid credential.
pub const CLOSE_UNAUTHORIZED: u16 = 4401;

/// Close code for an unparseable client frame.
pub const CLOSE_BAD_REQUEST: u16 = 4400;

/// Close code for a connection whose outbound buffer overflowed.
pub const CLOSE_SLOW_CONSUMER: u16 = 4408;

/// Close code for idle timeout and server shutdown.
pub const CLOSE_GOING_AWAY: u16 = 1001;

pub const CLOSE_INTERNAL: u16 = 1011;

/// Server → client frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub event: ServerEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "event",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    NewNotification {
        notification: Notification,
    },
    NotificationUpdated {
        notification_id: Uuid,
        read_at: Option<DateTime<Utc>>,
        deleted: bool,
    },
    UnreadCount {
        count: i64,
    },
    /// First page plus count, sent once when a connection becomes active.
    InitialNotifications {
        items: Vec<Notification>,
        next_cursor: Option<String>,
        unread_count: i64,
    },
    /// Reply to `fetch-notifications`.
    Notifications {
        items: Vec<Notification>,
        next_cursor: Option<String>,
    },
    MarkedAllRead {
        updated: u64,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn push(event: ServerEvent) -> Self {
        Self {
            correlation_id: None,
            event,
        }
    }

    pub fn reply(correlation_id: impl Into<String>, event: ServerEvent) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            event,
        }
    }

    pub fn new_notification(notification: Notification) -> Self {
        Self::push(ServerEvent::NewNotification { notification })
    }

    pub fn unread_count(count: i64) -> Self {
        Self::push(ServerEvent::UnreadCount { count })
    }

    pub fn read(notification_id: Uuid, read_at: Option<DateTime<Utc>>) -> Self {
        Self::push(ServerEvent::NotificationUpdated {
            notification_id,
            read_at,
            deleted: false,
        })
    }

    pub fn deleted(notification_id: Uuid) -> Self {
        Self::push(ServerEvent::NotificationUpdated {
            notification_id,
            read_at: None,
            deleted: true,
        })
    }

    pub fn initial(page: Page, unread_count: i64) -> Self {
        Self::push(ServerEvent::InitialNotifications {
            items: page.items,
            next_cursor: page.next_cursor,
            unread_count,
        })
    }

    pub fn error(
        correlation_id: Option<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id,
            event: ServerEvent::Error {
                code: code.into(),
                message: message.into(),
            },
        }
    }

    /// Error frame for a failed action. Store errors keep the connection open.
    pub fn from_app_error(correlation_id: Option<String>, err: &AppError) -> Self {
        let code = match err {
            AppError::NotFound(_) => "not_found",
            AppError::Forbidden(_) => "forbidden",
            AppError::Validation(_) | AppError::InvalidType(_) => "bad_request",
            _ => "internal",
        };
        let message = match err {
            AppError::Database(_) | AppError::Redis(_) | AppError::Internal(_) => {
                "Internal error".to_string()
            }
            other => other.to_string(),
        };
        Self::error(correlation_id, code, message)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Client → server frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    pub correlation_id: String,
    #[serde(flatten)]
    pub action: ClientAction,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(
    tag = "action",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientAction {
    MarkAsRead {
        notification_id: Uuid,
    },
    MarkAllAsRead,
    FetchNotifications {
        #[serde(default)]
        cursor: Option<String>,
        #[serde(default)]
        limit: Option<i64>,
        #[serde(default)]
        unread_only: bool,
        #[serde(default, rename = "type")]
        kind: Option<String>,
    },
}

impl ClientAction {
    pub fn name(&self) -> &'static str {
        match self {
            ClientAction::MarkAsRead { .. } => "mark-as-read",
            ClientAction::MarkAllAsRead => "mark-all-as-read",
            ClientAction::FetchNotifications { .. } => "fetch-notifications",
        }
    }
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
