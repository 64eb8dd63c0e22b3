//! Email channel: template rendering, the Resend HTTP transport and a Redis
//! send ledger that keeps lease-reclaimed jobs from mailing twice.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use reqwest::{Client, StatusCode};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use courier_common::error::ChannelError;
use courier_common::types::{Channel, Recipient};
use courier_engine::notifications::Notification;
use courier_engine::recipients::RecipientDirectory;

use crate::adapter::ChannelAdapter;
use crate::templates::TemplateRegistry;

const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";

/// A fully rendered message ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Stable per notification; providers use it to drop duplicate sends.
    pub idempotency_key: String,
}

pub fn idempotency_key(notification_id: Uuid) -> String {
    format!("notification-{}", notification_id)
}

/// Render the email for `notification` in the recipient's locale.
pub fn compose(
    notification: &Notification,
    recipient: &Recipient,
    templates: &TemplateRegistry,
) -> Result<EmailMessage, ChannelError> {
    let to = recipient
        .email
        .as_deref()
        .filter(|email| !email.trim().is_empty())
        .ok_or_else(|| ChannelError::Permanent("recipient has no email address".to_string()))?;

    let rendered = templates.render(
        notification.kind.name(),
        &recipient.locale,
        &notification.kind.fields(),
    )?;

    Ok(EmailMessage {
        to: to.to_string(),
        subject: rendered.subject,
        body: rendered.body,
        idempotency_key: idempotency_key(notification.id),
    })
}

#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), ChannelError>;
}

/// Resend (`POST /emails`) transport.
pub struct ResendTransport {
    client: Client,
    api_key: String,
    from: String,
    endpoint: String,
}

impl ResendTransport {
    pub fn new(api_key: String, from: String, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_key,
            from,
            endpoint: RESEND_ENDPOINT.to_string(),
        }
    }

    /// Point the transport at another Resend-compatible endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

/// 2xx is delivered; 429 and 5xx are retried; any other 4xx is final.
pub fn classify_status(status: StatusCode, body: &str) -> Result<(), ChannelError> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(ChannelError::Transient(format!("email provider returned {}: {}", status, body)))
    } else {
        Err(ChannelError::Permanent(format!("email provider returned {}: {}", status, body)))
    }
}

#[async_trait]
impl EmailTransport for ResendTransport {
    async fn send(&self, message: &EmailMessage) -> Result<(), ChannelError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", &message.idempotency_key)
            .json(&json!({
                "from": self.from,
                "to": [message.to],
                "subject": message.subject,
                "text": message.body,
            }))
            .send()
            .await
            .map_err(|e| ChannelError::Transient(format!("email request failed: {}", e)))?;

        let status = response.status();
        let body = if status.is_success() {
            String::new()
        } else {
            response.text().await.unwrap_or_default()
        };

        classify_status(status, &body)
    }
}

/// Result of trying to reserve a notification in the send ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// This caller may send.
    Acquired,
    /// A previous attempt already delivered the mail.
    AlreadySent,
    /// Another attempt holds a live reservation.
    InProgress,
}

/// Per-notification record of email sends.
#[async_trait]
pub trait SendLedger: Send + Sync {
    async fn reserve(&self, notification_id: Uuid) -> Result<Reservation, ChannelError>;

    async fn confirm(&self, notification_id: Uuid) -> Result<(), ChannelError>;

    async fn release(&self, notification_id: Uuid) -> Result<(), ChannelError>;
}

/// Redis-backed ledger.
///
/// `SET key pending NX EX <short>` reserves a send; a confirmed send rewrites
/// the key to `sent` with the long retention TTL. A crashed sender's
/// reservation expires on its own; its TTL must lapse before the crashed
/// worker's lease is reclaimed.
#[derive(Clone)]
pub struct RedisLedger {
    redis: ConnectionManager,
    pending_ttl_secs: u64,
    sent_ttl_secs: u64,
}

impl RedisLedger {
    pub fn new(redis: ConnectionManager, pending_ttl: Duration, retention_days: u32) -> Self {
        Self {
            redis,
            pending_ttl_secs: pending_ttl.as_secs().max(1),
            sent_ttl_secs: u64::from(retention_days.max(1)) * 86_400,
        }
    }

    fn key(notification_id: Uuid) -> String {
        format!("email:sent:{}", notification_id)
    }
}

fn ledger_error(e: redis::RedisError) -> ChannelError {
    ChannelError::Transient(format!("email ledger unavailable: {}", e))
}

#[async_trait]
impl SendLedger for RedisLedger {
    async fn reserve(&self, notification_id: Uuid) -> Result<Reservation, ChannelError> {
        let mut redis = self.redis.clone();
        let key = Self::key(notification_id);

        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg("pending")
            .arg("NX")
            .arg("EX")
            .arg(self.pending_ttl_secs)
            .query_async(&mut redis)
            .await
            .map_err(ledger_error)?;

        if set.is_some() {
            return Ok(Reservation::Acquired);
        }

        let state: Option<String> = redis::cmd("GET")
            .arg(&key)
            .query_async(&mut redis)
            .await
            .map_err(ledger_error)?;

        Ok(match state.as_deref() {
            Some("sent") => Reservation::AlreadySent,
            _ => Reservation::InProgress,
        })
    }

    async fn confirm(&self, notification_id: Uuid) -> Result<(), ChannelError> {
        let mut redis = self.redis.clone();
        redis::cmd("SET")
            .arg(Self::key(notification_id))
            .arg("sent")
            .arg("EX")
            .arg(self.sent_ttl_secs)
            .query_async::<()>(&mut redis)
            .await
            .map_err(ledger_error)
    }

    async fn release(&self, notification_id: Uuid) -> Result<(), ChannelError> {
        let mut redis = self.redis.clone();
        redis::cmd("DEL")
            .arg(Self::key(notification_id))
            .query_async::<()>(&mut redis)
            .await
            .map_err(ledger_error)
    }
}

pub struct EmailAdapter {
    pool: PgPool,
    templates: TemplateRegistry,
    transport: Arc<dyn EmailTransport>,
    ledger: Arc<dyn SendLedger>,
}

impl EmailAdapter {
    pub fn new(
        pool: PgPool,
        templates: TemplateRegistry,
        transport: Arc<dyn EmailTransport>,
        ledger: Arc<dyn SendLedger>,
    ) -> Self {
        Self {
            pool,
            templates,
            transport,
            ledger,
        }
    }
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, notification: &Notification) -> Result<(), ChannelError> {
        let recipient = RecipientDirectory::get(&self.pool, notification.recipient_id)
            .await?
            .ok_or_else(|| ChannelError::Permanent("recipient not found".to_string()))?;

        let message = compose(notification, &recipient, &self.templates)?;

        let reservation = match self.ledger.reserve(notification.id).await? {
            Reservation::Acquired => ReservationGuard::new(self.ledger.clone(), notification.id),
            Reservation::AlreadySent => {
                tracing::info!(
                    notification_id = %notification.id,
                    "Email already sent; skipping duplicate"
                );
                return Ok(());
            }
            Reservation::InProgress => {
                return Err(ChannelError::Transient(
                    "email send already in progress".to_string(),
                ));
            }
        };

        match self.transport.send(&message).await {
            Ok(()) => {
                reservation.confirm().await;
                Ok(())
            }
            Err(e) => {
                reservation.release().await;
                Err(e)
            }
        }
    }
}

/// Holds an acquired ledger reservation until it is confirmed or released.
///
/// Dropped unresolved (the send future was cancelled, e.g. by the worker's
/// adapter timeout), it releases the reservation on a background task so the
/// next attempt can acquire it.
struct ReservationGuard {
    ledger: Arc<dyn SendLedger>,
    notification_id: Uuid,
    armed: bool,
}

impl ReservationGuard {
    fn new(ledger: Arc<dyn SendLedger>, notification_id: Uuid) -> Self {
        Self {
            ledger,
            notification_id,
            armed: true,
        }
    }

    async fn confirm(mut self) {
        self.armed = false;
        if let Err(e) = self.ledger.confirm(self.notification_id).await {
            // The provider-side idempotency key still covers a repeat.
            tracing::warn!(
                notification_id = %self.notification_id,
                error = %e,
                "Failed to confirm email send"
            );
        }
    }

    async fn release(mut self) {
        self.armed = false;
        release_reservation(self.ledger.as_ref(), self.notification_id).await;
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let ledger = self.ledger.clone();
        let notification_id = self.notification_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    release_reservation(ledger.as_ref(), notification_id).await;
                });
            }
            Err(_) => tracing::warn!(
                notification_id = %notification_id,
                "No runtime to release email reservation; it expires on its own"
            ),
        }
    }
}

async fn release_reservation(ledger: &dyn SendLedger, notification_id: Uuid) {
    if let Err(e) = ledger.release(notification_id).await {
        tracing::warn!(
            notification_id = %notification_id,
            error = %e,
            "Failed to release email reservation"
        );
    }
}
