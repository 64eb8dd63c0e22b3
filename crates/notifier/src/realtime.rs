use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;

use courier_common::error::ChannelError;
use courier_common::types::Channel;
use courier_engine::notifications::{Notification, NotificationService};
use courier_realtime::protocol::ServerMessage;
use courier_realtime::registry::ConnectionRegistry;

use crate::adapter::ChannelAdapter;

/// In-app channel: hands the notification and the fresh unread count to every
/// live connection of the recipient. No connections is still a delivery.
///
/// The registry is process-local, so only connections held by the instance
/// that claimed the job are reached.
pub struct RealtimeAdapter {
    pool: PgPool,
    registry: Arc<ConnectionRegistry>,
}

impl RealtimeAdapter {
    pub fn new(pool: PgPool, registry: Arc<ConnectionRegistry>) -> Self {
        Self { pool, registry }
    }
}

#[async_trait]
impl ChannelAdapter for RealtimeAdapter {
    fn channel(&self) -> Channel {
        Channel::Realtime
    }

    async fn send(&self, notification: &Notification) -> Result<(), ChannelError> {
        let recipient_id = notification.recipient_id;
        let count = NotificationService::unread_count(&self.pool, recipient_id).await?;

        let reached = self
            .registry
            .broadcast(recipient_id, &ServerMessage::new_notification(notification.clone()));
        self.registry
            .broadcast(recipient_id, &ServerMessage::unread_count(count));

        tracing::debug!(
            notification_id = %notification.id,
            recipient_id = %recipient_id,
            local_connections = reached,
            scope = "instance-local",
            "Realtime event broadcast to this instance's connections"
        );
        Ok(())
    }
}
