//! Push channel. One notification fans out to every device token of the
//! recipient; tokens the gateway reports as invalid are pruned.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use courier_common::error::ChannelError;
use courier_common::types::{Channel, DeviceToken, Platform};
use courier_engine::devices::DeviceTokenService;
use courier_engine::notifications::Notification;

use crate::adapter::ChannelAdapter;

/// Platform-neutral push content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub notification_id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub body: String,
}

impl PushMessage {
    pub fn for_notification(notification: &Notification) -> Self {
        let (title, body) = notification.kind.summary();
        Self {
            notification_id: notification.id,
            kind: notification.kind.name().to_string(),
            title,
            body,
        }
    }
}

/// What the gateway said about one device token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// Token is unknown or unregistered; it will never accept a push again.
    Invalid,
    Transient(String),
    /// The gateway refused this message; the token itself stays registered.
    Rejected(String),
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, device: &DeviceToken, message: &PushMessage) -> PushOutcome;
}

/// HTTP push gateway relaying to APNs, FCM and Web Push.
pub struct HttpPushTransport {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpPushTransport {
    pub fn new(gateway_url: &str, api_key: Option<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            endpoint: format!("{}/v1/send", gateway_url.trim_end_matches('/')),
            api_key,
        }
    }
}

/// 200/202 accepted; 404/410 invalid token; 429 and 5xx retried; other 4xx final.
pub fn classify_push_status(status: StatusCode) -> PushOutcome {
    match status {
        StatusCode::OK | StatusCode::ACCEPTED | StatusCode::CREATED => PushOutcome::Accepted,
        StatusCode::NOT_FOUND | StatusCode::GONE => PushOutcome::Invalid,
        StatusCode::TOO_MANY_REQUESTS => {
            PushOutcome::Transient("push gateway rate limited".to_string())
        }
        s if s.is_server_error() => PushOutcome::Transient(format!("push gateway returned {}", s)),
        s => PushOutcome::Rejected(format!("push gateway returned {}", s)),
    }
}

fn platform_name(platform: Platform) -> &'static str {
    match platform {
        Platform::Ios => "apns",
        Platform::Android => "fcm",
        Platform::Web => "webpush",
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn send(&self, device: &DeviceToken, message: &PushMessage) -> PushOutcome {
        let mut request = self.client.post(&self.endpoint).json(&json!({
            "provider": platform_name(device.platform),
            "token": device.token,
            "message": message,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        match request.send().await {
            Ok(response) => classify_push_status(response.status()),
            Err(e) => PushOutcome::Transient(format!("push request failed: {}", e)),
        }
    }
}

/// Collapse per-token outcomes into the channel result.
///
/// One accepted token is a delivery. Invalid tokens are pruned, so the job is
/// final only once every token was invalid; while any token survives (a
/// transient failure or a rejected message) the attempt is retried.
pub fn summarize(outcomes: &[PushOutcome]) -> Result<(), ChannelError> {
    if outcomes.iter().any(|o| matches!(o, PushOutcome::Accepted)) {
        return Ok(());
    }

    let transient = outcomes.iter().find_map(|o| match o {
        PushOutcome::Transient(reason) => Some(reason),
        _ => None,
    });
    let rejected = outcomes.iter().find_map(|o| match o {
        PushOutcome::Rejected(reason) => Some(reason),
        _ => None,
    });

    match transient.or(rejected) {
        Some(reason) => Err(ChannelError::Transient(reason.clone())),
        None => Err(ChannelError::Permanent(
            "all device tokens invalid".to_string(),
        )),
    }
}

pub struct PushAdapter {
    pool: PgPool,
    transport: Arc<dyn PushTransport>,
}

impl PushAdapter {
    pub fn new(pool: PgPool, transport: Arc<dyn PushTransport>) -> Self {
        Self { pool, transport }
    }
}

#[async_trait]
impl ChannelAdapter for PushAdapter {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn send(&self, notification: &Notification) -> Result<(), ChannelError> {
        let devices =
            DeviceTokenService::list_for_recipient(&self.pool, notification.recipient_id).await?;
        if devices.is_empty() {
            return Err(ChannelError::Permanent("no device tokens".to_string()));
        }

        let message = PushMessage::for_notification(notification);
        let outcomes = join_all(
            devices
                .iter()
                .map(|device| self.transport.send(device, &message)),
        )
        .await;

        let mut accepted = Vec::new();
        for (device, outcome) in devices.iter().zip(&outcomes) {
            match outcome {
                PushOutcome::Accepted => accepted.push(device.token.clone()),
                PushOutcome::Invalid => {
                    if let Err(e) = DeviceTokenService::prune(&self.pool, &device.token).await {
                        tracing::warn!(
                            recipient_id = %device.recipient_id,
                            platform = %device.platform,
                            error = %e,
                            "Failed to prune invalid device token"
                        );
                    }
                }
                PushOutcome::Transient(reason) | PushOutcome::Rejected(reason) => {
                    tracing::debug!(
                        notification_id = %notification.id,
                        platform = %device.platform,
                        reason = %reason,
                        "Push to device failed"
                    );
                }
            }
        }

        if let Err(e) = DeviceTokenService::mark_validated(&self.pool, &accepted).await {
            tracing::warn!(error = %e, "Failed to refresh device token validation time");
        }

        summarize(&outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_any_accepted_is_delivered() {
        let outcomes = [
            PushOutcome::Invalid,
            PushOutcome::Accepted,
            PushOutcome::Transient("x".into()),
        ];
        assert!(summarize(&outcomes).is_ok());
    }

    #[test]
    fn test_transient_wins_over_invalid() {
        let outcomes = [PushOutcome::Invalid, PushOutcome::Transient("503".into())];
        assert_eq!(
            summarize(&outcomes),
            Err(ChannelError::Transient("503".into()))
        );
    }

    #[test]
    fn test_rejected_token_still_valid_is_retried() {
        let outcomes = [
            PushOutcome::Invalid,
            PushOutcome::Rejected("push gateway returned 400".into()),
        ];
        assert_eq!(
            summarize(&outcomes),
            Err(ChannelError::Transient("push gateway returned 400".into()))
        );
    }

    #[test]
    fn test_all_invalid_is_permanent() {
        let err = summarize(&[PushOutcome::Invalid, PushOutcome::Invalid]).unwrap_err();
        assert_eq!(err.reason(), "all device tokens invalid");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_classify_push_status() {
        assert_eq!(classify_push_status(StatusCode::ACCEPTED), PushOutcome::Accepted);
        assert_eq!(classify_push_status(StatusCode::GONE), PushOutcome::Invalid);
        assert!(matches!(
            classify_push_status(StatusCode::BAD_GATEWAY),
            PushOutcome::Transient(_)
        ));
        assert!(matches!(
            classify_push_status(StatusCode::BAD_REQUEST),
            PushOutcome::Rejected(_)
        ));
    }
}
