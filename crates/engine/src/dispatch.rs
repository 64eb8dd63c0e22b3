//! Dispatch orchestrator: turns a stored notification into delivery jobs.
//!
//! The enabled channel set is `requested ∩ permitted-for-type ∩ preference`.
//! One job is enqueued per enabled channel; the `(notification_id, channel)`
//! uniqueness key makes repeated dispatch a no-op.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::time::Instant;
use uuid::Uuid;

use courier_common::config::{BackpressureMode, DeliveryConfig};
use courier_common::error::AppError;
use courier_common::payload::NotificationKind;
use courier_common::types::{Channel, DigestFrequency};

use crate::notifications::{Notification, NotificationService};
use crate::preferences::{Preference, PreferenceService};
use crate::queue::DeliveryQueue;

/// What a dispatch did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Channels with a newly created job.
    pub enqueued: Vec<Channel>,
    /// Requested channels filtered out by type or preference.
    pub suppressed: Vec<Channel>,
}

/// Channels a notification will actually be sent on.
pub fn enabled_channels(
    kind: &NotificationKind,
    requested: &BTreeSet<Channel>,
    preference: &Preference,
) -> BTreeSet<Channel> {
    requested
        .iter()
        .copied()
        .filter(|channel| kind.permitted_channels().contains(channel))
        .filter(|channel| preference.allows(kind.name(), *channel))
        .collect()
}

/// When a job may first run. `None` means immediately.
///
/// Only email honours digest batching; it is held until the next boundary
/// (top of the hour, or midnight UTC).
pub fn release_at(
    channel: Channel,
    digest: DigestFrequency,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let period = match (channel, digest) {
        (Channel::Email, DigestFrequency::Hourly) => 3_600,
        (Channel::Email, DigestFrequency::Daily) => 86_400,
        _ => return None,
    };

    let next = (now.timestamp().div_euclid(period) + 1) * period;
    DateTime::from_timestamp(next, 0)
}

/// Dispatch orchestrator over the notification store and delivery queue.
#[derive(Clone)]
pub struct Dispatcher {
    pool: PgPool,
    queue: DeliveryQueue,
    config: DeliveryConfig,
}

impl Dispatcher {
    pub fn new(pool: PgPool, config: DeliveryConfig) -> Self {
        Self {
            queue: DeliveryQueue::new(pool.clone()),
            pool,
            config,
        }
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    /// Create and dispatch a notification in one call (ingestion path).
    ///
    /// Backpressure is checked before the row is written. A dispatch failure
    /// after the write is logged and left to the sweeper, which re-dispatches
    /// rows without `dispatched_at`.
    pub async fn ingest(
        &self,
        recipient_id: Uuid,
        kind: &NotificationKind,
        channels: &[Channel],
    ) -> Result<Notification, AppError> {
        let requested: Vec<Channel> = channels
            .iter()
            .copied()
            .filter(|channel| kind.permitted_channels().contains(channel))
            .collect();
        self.admit(&requested).await?;

        let notification =
            NotificationService::create(&self.pool, recipient_id, kind, channels).await?;

        if let Err(e) = self.dispatch(notification.id).await {
            tracing::warn!(
                notification_id = %notification.id,
                error = %e,
                "Dispatch failed; the sweeper will retry"
            );
        }

        Ok(notification)
    }

    /// Check every partition the caller is about to load.
    pub async fn admit(&self, channels: &[Channel]) -> Result<(), AppError> {
        let block_timeout = Duration::from_millis(self.config.backpressure_block_timeout_ms);
        let deadline = Instant::now() + block_timeout;

        for channel in channels {
            loop {
                let outstanding = self.queue.outstanding(*channel).await?;
                if outstanding < self.config.partition_max_in_flight {
                    break;
                }

                let saturated = || {
                    tracing::warn!(
                        channel = %channel,
                        outstanding,
                        limit = self.config.partition_max_in_flight,
                        "Delivery partition saturated"
                    );
                    AppError::QueueSaturated(format!("{} partition is saturated", channel))
                };

                match self.config.backpressure_mode {
                    BackpressureMode::FailFast => return Err(saturated()),
                    BackpressureMode::Block => {
                        if Instant::now() + self.config.poll_interval() > deadline {
                            return Err(saturated());
                        }
                        tokio::time::sleep(self.config.poll_interval()).await;
                    }
                }
            }
        }

        Ok(())
    }

    /// Enqueue one job per enabled channel and stamp `dispatched_at`.
    pub async fn dispatch(&self, notification_id: Uuid) -> Result<DispatchOutcome, AppError> {
        let notification = NotificationService::find(&self.pool, notification_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Notification {} not found", notification_id))
            })?;

        if notification.is_tombstoned() {
            tracing::debug!(
                notification_id = %notification_id,
                "Skipping dispatch of purged notification"
            );
            return Ok(DispatchOutcome::default());
        }

        let preference = PreferenceService::get(&self.pool, notification.recipient_id).await?;
        let enabled = enabled_channels(
            &notification.kind,
            &notification.channels_requested,
            &preference,
        );

        let now = Utc::now();
        let mut outcome = DispatchOutcome {
            enqueued: Vec::new(),
            suppressed: notification
                .channels_requested
                .difference(&enabled)
                .copied()
                .collect(),
        };

        let mut tx = self.pool.begin().await?;
        for channel in &enabled {
            let run_at = release_at(*channel, preference.digest, now);
            if DeliveryQueue::enqueue(&mut *tx, notification_id, *channel, run_at).await? {
                outcome.enqueued.push(*channel);
            }
        }
        NotificationService::mark_dispatched(&mut *tx, notification_id).await?;
        tx.commit().await?;

        tracing::info!(
            notification_id = %notification_id,
            enqueued = ?outcome.enqueued,
            suppressed = ?outcome.suppressed,
            "Notification dispatched"
        );

        Ok(outcome)
    }

    /// Re-dispatch notifications older than `older_than` that never finished dispatch.
    pub async fn redispatch_stale(
        &self,
        older_than: chrono::Duration,
        limit: i64,
    ) -> Result<usize, AppError> {
        let ids = NotificationService::find_undispatched(&self.pool, older_than, limit).await?;
        let mut dispatched = 0;

        for id in ids {
            match self.dispatch(id).await {
                Ok(_) => dispatched += 1,
                Err(e) => {
                    tracing::warn!(notification_id = %id, error = %e, "Re-dispatch failed");
                }
            }
        }

        Ok(dispatched)
    }
}
