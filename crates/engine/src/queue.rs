//! Durable delivery queue, partitioned by channel.
//!
//! One row per `(notification_id, channel)`. Workers claim rows with
//! `FOR UPDATE SKIP LOCKED` and receive a lease (random token + expiry taken
//! from the database clock). Every completion call must present the lease
//! token; once a lease expired and the job was claimed again, the stale
//! holder's calls match no row and change nothing.
//!
//! Finished jobs keep their row with a terminal status so the uniqueness key
//! keeps blocking re-dispatch; the sweeper deletes them after the retention
//! window.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::PgExecutor;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{Channel, DeliveryRecord, JobStatus};

use crate::notifications::NotificationService;

/// A queued delivery of one notification on one channel.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryJob {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub channel: Channel,
    pub status: JobStatus,
    /// Attempts that have finished (successfully or not).
    pub attempt: i32,
    pub next_retry_at: DateTime<Utc>,
    pub lease_token: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Postgres-backed delivery queue.
#[derive(Clone)]
pub struct DeliveryQueue {
    pool: PgPool,
}

impl DeliveryQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a pending job unless one already exists for the pair.
    ///
    /// `run_at = None` makes the job claimable immediately. Returns `true`
    /// when a new row was created.
    pub async fn enqueue<'e, E: PgExecutor<'e>>(
        executor: E,
        notification_id: Uuid,
        channel: Channel,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO delivery_jobs (id, notification_id, channel, status, attempt, next_retry_at)
            VALUES ($1, $2, $3, 'pending', 0, COALESCE($4, NOW()))
            ON CONFLICT (notification_id, channel) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(notification_id)
        .bind(channel)
        .bind(run_at)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Lease up to `limit` claimable jobs of one partition.
    ///
    /// Claimable means pending and due, or in flight with an expired lease
    /// (the previous holder crashed or stalled).
    pub async fn claim(
        &self,
        channel: Channel,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<DeliveryJob>, AppError> {
        let jobs: Vec<DeliveryJob> = sqlx::query_as(
            r#"
            UPDATE delivery_jobs j
            SET status = 'in_flight',
                lease_token = gen_random_uuid(),
                lease_expires_at = NOW() + make_interval(secs => $3),
                updated_at = NOW()
            FROM (
                SELECT id
                FROM delivery_jobs
                WHERE channel = $1
                  AND (
                        (status = 'pending' AND next_retry_at <= NOW())
                     OR (status = 'in_flight' AND lease_expires_at <= NOW())
                  )
                ORDER BY next_retry_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            ) claimable
            WHERE j.id = claimable.id
            RETURNING j.*
            "#,
        )
        .bind(channel)
        .bind(limit)
        .bind(lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        if !jobs.is_empty() {
            tracing::debug!(channel = %channel, claimed = jobs.len(), "Claimed delivery jobs");
        }

        Ok(jobs)
    }

    /// Finish a job as delivered and record `sent` on the notification.
    ///
    /// Returns `false` when the lease was lost; nothing is written then.
    pub async fn complete(&self, job: &DeliveryJob) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        let finished = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = 'succeeded',
                attempt = attempt + 1,
                lease_token = NULL,
                lease_expires_at = NULL,
                last_error = NULL,
                updated_at = NOW()
            WHERE id = $1 AND lease_token = $2 AND status = 'in_flight'
            "#,
        )
        .bind(job.id)
        .bind(job.lease_token)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if finished {
            NotificationService::record_delivery(
                &mut *tx,
                job.notification_id,
                job.channel,
                &DeliveryRecord::sent(Utc::now()),
            )
            .await?;
        }

        tx.commit().await?;
        Ok(finished)
    }

    /// Put a transiently failed job back in the queue after `delay`.
    pub async fn retry(
        &self,
        job: &DeliveryJob,
        delay: Duration,
        error: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = 'pending',
                attempt = attempt + 1,
                next_retry_at = NOW() + make_interval(secs => $3),
                lease_token = NULL,
                lease_expires_at = NULL,
                last_error = $4,
                updated_at = NOW()
            WHERE id = $1 AND lease_token = $2 AND status = 'in_flight'
            "#,
        )
        .bind(job.id)
        .bind(job.lease_token)
        .bind(delay.as_secs_f64())
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Finish a job as permanently failed and record the reason on the notification.
    pub async fn fail(&self, job: &DeliveryJob, reason: &str) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        let finished = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = 'failed',
                attempt = attempt + 1,
                lease_token = NULL,
                lease_expires_at = NULL,
                last_error = $3,
                updated_at = NOW()
            WHERE id = $1 AND lease_token = $2 AND status = 'in_flight'
            "#,
        )
        .bind(job.id)
        .bind(job.lease_token)
        .bind(reason)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if finished {
            NotificationService::record_delivery(
                &mut *tx,
                job.notification_id,
                job.channel,
                &DeliveryRecord::failed(Utc::now(), reason),
            )
            .await?;
        }

        tx.commit().await?;
        Ok(finished)
    }

    /// Return jobs with expired leases to `pending`. Idempotent.
    pub async fn reclaim_expired(&self) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = 'pending',
                lease_token = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE status = 'in_flight' AND lease_expires_at <= NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Delete finished jobs older than the retention window.
    pub async fn purge_finished(&self, retention_days: u32) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM delivery_jobs
            WHERE status IN ('succeeded', 'failed')
              AND updated_at < NOW() - make_interval(days => $1)
            "#,
        )
        .bind(retention_days as i32)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Due pending plus in-flight jobs of one partition. Jobs held for a
    /// later digest or backoff do not count.
    pub async fn outstanding(&self, channel: Channel) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM delivery_jobs
            WHERE channel = $1
              AND (status = 'in_flight' OR (status = 'pending' AND next_retry_at <= NOW()))
            "#,
        )
        .bind(channel)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    pub async fn find(
        &self,
        notification_id: Uuid,
        channel: Channel,
    ) -> Result<Option<DeliveryJob>, AppError> {
        let job: Option<DeliveryJob> = sqlx::query_as(
            "SELECT * FROM delivery_jobs WHERE notification_id = $1 AND channel = $2",
        )
        .bind(notification_id)
        .bind(channel)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    pub async fn jobs_for(&self, notification_id: Uuid) -> Result<Vec<DeliveryJob>, AppError> {
        let jobs: Vec<DeliveryJob> = sqlx::query_as(
            "SELECT * FROM delivery_jobs WHERE notification_id = $1 ORDER BY channel",
        )
        .bind(notification_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }
}
