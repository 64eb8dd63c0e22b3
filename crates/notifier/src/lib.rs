//! Channel adapters and the delivery worker harness.
//!
//! Each channel partition of the delivery queue is drained by a [`Worker`]
//! wrapping one [`ChannelAdapter`]. The [`Sweeper`] reclaims expired leases,
//! re-dispatches stalled notifications and prunes finished jobs.

pub mod adapter;
pub mod email;
pub mod push;
pub mod realtime;
pub mod retry;
pub mod sweeper;
pub mod templates;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use courier_common::config::{AppConfig, DeliveryConfig};
use courier_engine::queue::DeliveryQueue;

pub use adapter::ChannelAdapter;
pub use sweeper::Sweeper;
pub use worker::Worker;

use email::{EmailAdapter, RedisLedger, ResendTransport};
use push::{HttpPushTransport, PushAdapter};
use templates::TemplateRegistry;

/// Slack on top of the adapter timeout before an orphaned email reservation lapses.
const RESERVATION_MARGIN: Duration = Duration::from_secs(5);

/// Adapters for the external channels (email, push) whose transports are configured.
pub fn external_adapters(
    pool: &PgPool,
    redis: &ConnectionManager,
    config: &AppConfig,
) -> Vec<Arc<dyn ChannelAdapter>> {
    let mut adapters: Vec<Arc<dyn ChannelAdapter>> = Vec::new();
    let timeout = config.delivery.adapter_timeout();

    match (&config.resend_api_key, &config.email_from) {
        (Some(api_key), Some(from)) => match TemplateRegistry::with_defaults() {
            Ok(templates) => {
                let transport = ResendTransport::new(api_key.clone(), from.clone(), timeout);
                let ledger = RedisLedger::new(
                    redis.clone(),
                    timeout + RESERVATION_MARGIN,
                    config.delivery.retention_days,
                );
                adapters.push(Arc::new(EmailAdapter::new(
                    pool.clone(),
                    templates,
                    Arc::new(transport),
                    Arc::new(ledger),
                )));
            }
            Err(e) => tracing::error!(error = %e, "Email templates failed to load; email partition disabled"),
        },
        _ => tracing::warn!("RESEND_API_KEY or EMAIL_FROM not set; email partition disabled"),
    }

    match &config.push_gateway_url {
        Some(url) => {
            let transport = HttpPushTransport::new(url, config.push_gateway_key.clone(), timeout);
            adapters.push(Arc::new(PushAdapter::new(pool.clone(), Arc::new(transport))));
        }
        None => tracing::warn!("PUSH_GATEWAY_URL not set; push partition disabled"),
    }

    adapters
}

/// Start one worker per adapter. Each handle resolves once its worker has
/// drained after `cancel`.
pub fn spawn_workers(
    pool: &PgPool,
    adapters: Vec<Arc<dyn ChannelAdapter>>,
    config: &DeliveryConfig,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    adapters
        .into_iter()
        .map(|adapter| {
            let worker = Arc::new(Worker::new(
                DeliveryQueue::new(pool.clone()),
                adapter,
                config.clone(),
            ));
            tokio::spawn(worker.run(cancel.clone()))
        })
        .collect()
}
