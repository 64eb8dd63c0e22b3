//! Worker harness: claims leased jobs of one channel partition and runs them
//! through that channel's adapter.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use courier_common::config::DeliveryConfig;
use courier_common::error::{AppError, ChannelError};
use courier_common::types::Channel;
use courier_engine::notifications::NotificationService;
use courier_engine::queue::{DeliveryJob, DeliveryQueue};

use crate::adapter::ChannelAdapter;
use crate::retry::{RetryDecision, RetryPolicy};

/// How a single processed job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Delivered,
    Retrying { delay: Duration },
    Failed { reason: String },
    /// The lease expired and another worker owns the job; nothing was written.
    LeaseLost,
}

pub struct Worker {
    queue: DeliveryQueue,
    adapter: Arc<dyn ChannelAdapter>,
    policy: RetryPolicy,
    config: DeliveryConfig,
}

impl Worker {
    pub fn new(
        queue: DeliveryQueue,
        adapter: Arc<dyn ChannelAdapter>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            queue,
            adapter,
            policy: RetryPolicy::from_config(&config),
            config,
        }
    }

    pub fn channel(&self) -> Channel {
        self.adapter.channel()
    }

    /// Run one claimed job to its next state.
    pub async fn process(&self, job: &DeliveryJob) -> Result<JobOutcome, AppError> {
        let attempts = u32::try_from(job.attempt).unwrap_or(0) + 1;

        let notification = NotificationService::find(self.queue.pool(), job.notification_id)
            .await?
            .filter(|n| !n.is_tombstoned());

        let result = match notification {
            None => Err(ChannelError::Permanent("purged".to_string())),
            Some(notification) => {
                match tokio::time::timeout(
                    self.config.adapter_timeout(),
                    self.adapter.send(&notification),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ChannelError::Transient(format!(
                        "adapter timed out after {}ms",
                        self.config.adapter_timeout_ms
                    ))),
                }
            }
        };

        let (applied, outcome) = match result {
            Ok(()) => (self.queue.complete(job).await?, JobOutcome::Delivered),
            Err(e) => match self.policy.decide(attempts, &e) {
                RetryDecision::Retry { delay, error } => (
                    self.queue.retry(job, delay, &error).await?,
                    JobOutcome::Retrying { delay },
                ),
                RetryDecision::Fail { reason } => (
                    self.queue.fail(job, &reason).await?,
                    JobOutcome::Failed { reason },
                ),
            },
        };

        if !applied {
            tracing::warn!(
                job_id = %job.id,
                notification_id = %job.notification_id,
                channel = %job.channel,
                "Lease lost before the job finished; result discarded"
            );
            return Ok(JobOutcome::LeaseLost);
        }

        match &outcome {
            JobOutcome::Delivered => tracing::info!(
                job_id = %job.id,
                notification_id = %job.notification_id,
                channel = %job.channel,
                attempt = attempts,
                "Delivered"
            ),
            JobOutcome::Retrying { delay } => tracing::warn!(
                job_id = %job.id,
                notification_id = %job.notification_id,
                channel = %job.channel,
                attempt = attempts,
                retry_in_ms = delay.as_millis() as u64,
                "Delivery failed; retry scheduled"
            ),
            JobOutcome::Failed { reason } => tracing::error!(
                job_id = %job.id,
                notification_id = %job.notification_id,
                channel = %job.channel,
                attempt = attempts,
                reason = %reason,
                "Delivery failed permanently"
            ),
            JobOutcome::LeaseLost => {}
        }

        Ok(outcome)
    }

    /// Claim up to `limit` due jobs and process them in order.
    pub async fn run_once(&self, limit: i64) -> Result<Vec<JobOutcome>, AppError> {
        let jobs = self
            .queue
            .claim(self.channel(), self.config.lease(), limit)
            .await?;

        let mut outcomes = Vec::with_capacity(jobs.len());
        for job in &jobs {
            outcomes.push(self.process(job).await?);
        }
        Ok(outcomes)
    }

    /// Poll the partition until `cancel` fires, then wait for in-flight jobs.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let channel = self.channel();
        let permits = Arc::new(Semaphore::new(self.config.worker_concurrency.max(1)));
        let tracker = TaskTracker::new();

        tracing::info!(
            channel = %channel,
            concurrency = self.config.worker_concurrency,
            poll_interval_ms = self.config.poll_interval_ms,
            "Delivery worker started"
        );

        while !cancel.is_cancelled() {
            let available = permits.available_permits() as i64;
            let jobs = if available == 0 {
                Vec::new()
            } else {
                match self
                    .queue
                    .claim(channel, self.config.lease(), available)
                    .await
                {
                    Ok(jobs) => jobs,
                    Err(e) => {
                        tracing::error!(channel = %channel, error = %e, "Failed to claim jobs");
                        Vec::new()
                    }
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval()) => {}
                }
                continue;
            }

            for job in jobs {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let worker = self.clone();
                tracker.spawn(async move {
                    if let Err(e) = worker.process(&job).await {
                        // The lease expires and the job is reclaimed.
                        tracing::error!(
                            job_id = %job.id,
                            channel = %job.channel,
                            error = %e,
                            "Failed to record job outcome"
                        );
                    }
                    drop(permit);
                });
            }
        }

        tracker.close();
        tracker.wait().await;
        tracing::info!(channel = %channel, "Delivery worker stopped");
    }
}
