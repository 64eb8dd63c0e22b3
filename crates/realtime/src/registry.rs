//! Live connection registry.
//!
//! Connections are grouped per recipient in a [`DashMap`] whose shards are
//! selected by the recipient id hash, so register/deregister/broadcast for
//! different recipients rarely contend. Broadcasts never wait: each
//! connection owns a bounded outbound buffer, and a connection whose buffer
//! is full is closed and dropped from the registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::{CLOSE_GOING_AWAY, CLOSE_SLOW_CONSUMER, ServerMessage};

/// Unique id of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why the registry asked a connection to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    SlowConsumer,
    Shutdown,
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::SlowConsumer => CLOSE_SLOW_CONSUMER,
            CloseReason::Shutdown => CLOSE_GOING_AWAY,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            CloseReason::SlowConsumer => "slow consumer",
            CloseReason::Shutdown => "server shutting down",
        }
    }
}

/// Registry-side handle of a connection.
#[derive(Debug)]
struct ConnectionHandle {
    established_at: DateTime<Utc>,
    sender: mpsc::Sender<ServerMessage>,
    closed: CancellationToken,
    close_reason: Arc<OnceLock<CloseReason>>,
}

impl ConnectionHandle {
    fn close(&self, reason: CloseReason) {
        let _ = self.close_reason.set(reason);
        self.closed.cancel();
    }
}

/// Session-side half of a registration.
#[derive(Debug)]
pub struct Registration {
    pub id: ConnectionId,
    pub recipient_id: Uuid,
    pub established_at: DateTime<Utc>,
    /// Pushed events, in broadcast order.
    pub events: mpsc::Receiver<ServerMessage>,
    /// Cancelled when the registry closes this connection.
    pub closed: CancellationToken,
    close_reason: Arc<OnceLock<CloseReason>>,
}

impl Registration {
    /// Set once `closed` has fired.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }
}

/// Summary of one connection, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub recipient_id: Uuid,
    pub established_at: DateTime<Utc>,
}

/// Sharded map of live connections, keyed by recipient.
#[derive(Debug)]
pub struct ConnectionRegistry {
    recipients: DashMap<Uuid, HashMap<ConnectionId, ConnectionHandle>>,
    outbound_buffer: usize,
}

impl ConnectionRegistry {
    /// `shards` is rounded up to a power of two (minimum 2).
    pub fn new(shards: usize, outbound_buffer: usize) -> Self {
        let shards = shards.max(2).next_power_of_two();
        Self {
            recipients: DashMap::with_shard_amount(shards),
            outbound_buffer: outbound_buffer.max(1),
        }
    }

    pub fn register(&self, recipient_id: Uuid) -> Registration {
        let id = ConnectionId::generate();
        let (sender, events) = mpsc::channel(self.outbound_buffer);
        let closed = CancellationToken::new();
        let close_reason = Arc::new(OnceLock::new());
        let established_at = Utc::now();

        self.recipients.entry(recipient_id).or_default().insert(
            id,
            ConnectionHandle {
                established_at,
                sender,
                closed: closed.clone(),
                close_reason: close_reason.clone(),
            },
        );

        tracing::debug!(connection_id = %id, recipient_id = %recipient_id, "Connection registered");

        Registration {
            id,
            recipient_id,
            established_at,
            events,
            closed,
            close_reason,
        }
    }

    /// Remove a connection. Safe to call more than once.
    pub fn deregister(&self, recipient_id: Uuid, id: ConnectionId) {
        let removed = self
            .recipients
            .get_mut(&recipient_id)
            .and_then(|mut connections| connections.remove(&id))
            .is_some();
        self.recipients
            .remove_if(&recipient_id, |_, connections| connections.is_empty());

        if removed {
            tracing::debug!(connection_id = %id, recipient_id = %recipient_id, "Connection deregistered");
        }
    }

    /// Hand `message` to every live connection of `recipient_id`.
    ///
    /// Returns how many connections accepted it. Zero connections is not an
    /// error.
    pub fn broadcast(&self, recipient_id: Uuid, message: &ServerMessage) -> usize {
        self.broadcast_except(recipient_id, None, message)
    }

    /// Like [`broadcast`](Self::broadcast), skipping the `except` connection.
    pub fn broadcast_except(
        &self,
        recipient_id: Uuid,
        except: Option<ConnectionId>,
        message: &ServerMessage,
    ) -> usize {
        let mut delivered = 0;

        if let Some(mut connections) = self.recipients.get_mut(&recipient_id) {
            connections.retain(|id, handle| {
                if Some(*id) == except {
                    return true;
                }
                match handle.sender.try_send(message.clone()) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(
                            connection_id = %id,
                            recipient_id = %recipient_id,
                            "Outbound buffer full; closing slow connection"
                        );
                        handle.close(CloseReason::SlowConsumer);
                        false
                    }
                    Err(TrySendError::Closed(_)) => false,
                }
            });
        }

        self.recipients
            .remove_if(&recipient_id, |_, connections| connections.is_empty());

        delivered
    }

    /// Ask every connection to close (graceful shutdown).
    pub fn close_all(&self) {
        for entry in self.recipients.iter() {
            for handle in entry.value().values() {
                handle.close(CloseReason::Shutdown);
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.recipients.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn connections_for(&self, recipient_id: Uuid) -> Vec<ConnectionInfo> {
        self.recipients
            .get(&recipient_id)
            .map(|connections| {
                connections
                    .iter()
                    .map(|(id, handle)| ConnectionInfo {
                        id: *id,
                        recipient_id,
                        established_at: handle.established_at,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(4, 2)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_tab() {
        let registry = registry();
        let user = Uuid::new_v4();
        let mut a = registry.register(user);
        let mut b = registry.register(user);
        let mut other = registry.register(Uuid::new_v4());

        assert_eq!(registry.broadcast(user, &ServerMessage::unread_count(4)), 2);

        assert_eq!(a.events.recv().await, Some(ServerMessage::unread_count(4)));
        assert_eq!(b.events.recv().await, Some(ServerMessage::unread_count(4)));
        assert!(other.events.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_without_connections() {
        let registry = registry();
        assert_eq!(registry.broadcast(Uuid::new_v4(), &ServerMessage::unread_count(0)), 0);
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_broadcast_except_skips_origin() {
        let registry = registry();
        let user = Uuid::new_v4();
        let mut a = registry.register(user);
        let mut b = registry.register(user);

        let sent = registry.broadcast_except(user, Some(a.id), &ServerMessage::unread_count(1));
        assert_eq!(sent, 1);
        assert!(a.events.try_recv().is_err());
        assert!(b.events.try_recv().is_ok());
    }

    #[test]
    fn test_deregister_is_idempotent() {
        let registry = registry();
        let user = Uuid::new_v4();
        let a = registry.register(user);
        let _b = registry.register(user);
        assert_eq!(registry.connection_count(), 2);

        registry.deregister(user, a.id);
        registry.deregister(user, a.id);
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.connections_for(user).len(), 1);
    }

    #[test]
    fn test_slow_consumer_closed_without_affecting_others() {
        let registry = registry();
        let user = Uuid::new_v4();
        let slow = registry.register(user);
        let mut fast = registry.register(user);

        for count in 0..3 {
            registry.broadcast(user, &ServerMessage::unread_count(count));
            while fast.events.try_recv().is_ok() {}
        }

        assert!(slow.closed.is_cancelled());
        assert_eq!(slow.close_reason(), Some(CloseReason::SlowConsumer));
        assert!(!fast.closed.is_cancelled());
        assert_eq!(registry.connection_count(), 1);

        assert_eq!(registry.broadcast(user, &ServerMessage::unread_count(9)), 1);
    }

    #[test]
    fn test_dropped_session_is_pruned() {
        let registry = registry();
        let user = Uuid::new_v4();
        let gone = registry.register(user);
        drop(gone);

        assert_eq!(registry.broadcast(user, &ServerMessage::unread_count(1)), 0);
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_close_all() {
        let registry = registry();
        let a = registry.register(Uuid::new_v4());
        let b = registry.register(Uuid::new_v4());

        registry.close_all();
        assert_eq!(a.close_reason(), Some(CloseReason::Shutdown));
        assert!(b.closed.is_cancelled());
    }
}
