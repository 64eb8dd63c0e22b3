//! Periodic maintenance over the delivery queue. Every step is idempotent, so
//! any number of sweepers may run side by side.

use tokio_util::sync::CancellationToken;

use courier_common::config::DeliveryConfig;
use courier_common::error::AppError;
use courier_engine::dispatch::Dispatcher;

/// Notifications younger than this are still being dispatched by ingestion.
const REDISPATCH_GRACE_SECS: i64 = 30;

const REDISPATCH_BATCH: i64 = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed: u64,
    pub redispatched: usize,
    pub purged: u64,
}

pub struct Sweeper {
    dispatcher: Dispatcher,
    config: DeliveryConfig,
}

impl Sweeper {
    pub fn new(dispatcher: Dispatcher, config: DeliveryConfig) -> Self {
        Self { dispatcher, config }
    }

    pub async fn run_once(&self) -> Result<SweepReport, AppError> {
        let queue = self.dispatcher.queue();

        let reclaimed = queue.reclaim_expired().await?;
        let redispatched = self
            .dispatcher
            .redispatch_stale(
                chrono::Duration::seconds(REDISPATCH_GRACE_SECS),
                REDISPATCH_BATCH,
            )
            .await?;
        let purged = queue.purge_finished(self.config.retention_days).await?;

        Ok(SweepReport {
            reclaimed,
            redispatched,
            purged,
        })
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = self.config.sweep_interval_secs,
            retention_days = self.config.retention_days,
            "Maintenance sweeper started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.run_once().await {
                Ok(report) if report != SweepReport::default() => {
                    tracing::info!(
                        reclaimed = report.reclaimed,
                        redispatched = report.redispatched,
                        purged = report.purged,
                        "Sweep complete"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Sweep failed"),
            }
        }

        tracing::info!("Maintenance sweeper stopped");
    }
}
