//! Notification store: durable notifications, read-state and unread counts.
//!
//! The unread count is never stored. It is always recomputed from the
//! predicate "unread, not tombstoned, owned by the recipient", so it cannot
//! drift from the rows themselves. Read-state mutations take the recipient's
//! row lock and recompute the count inside the same transaction.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use sqlx::postgres::PgExecutor;
use sqlx::types::Json;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::payload::NotificationKind;
use courier_common::types::{Channel, DeliveryRecord};

use crate::cursor::Cursor;
use crate::recipients::RecipientDirectory;

/// Default page size for listings.
pub const DEFAULT_PAGE_SIZE: i64 = 20;

/// Largest page a client may request.
pub const MAX_PAGE_SIZE: i64 = 100;

const COLUMNS: &str = "id, recipient_id, kind, payload, channels_requested, channels_delivered, \
                       created_at, read_at, deleted_at";

/// A persisted notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    #[serde(flatten)]
    pub kind: NotificationKind,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub channels_requested: BTreeSet<Channel>,
    pub channels_delivered: BTreeMap<Channel, DeliveryRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }

    pub fn is_tombstoned(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.created_at, self.id)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct NotificationRow {
    id: Uuid,
    recipient_id: Uuid,
    kind: String,
    payload: Json<Value>,
    channels_requested: Json<BTreeSet<Channel>>,
    channels_delivered: Json<BTreeMap<Channel, DeliveryRecord>>,
    created_at: DateTime<Utc>,
    read_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = AppError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        Ok(Notification {
            id: row.id,
            recipient_id: row.recipient_id,
            kind: NotificationKind::from_stored(&row.kind, row.payload.0)?,
            created_at: row.created_at,
            read_at: row.read_at,
            channels_requested: row.channels_requested.0,
            channels_delivered: row.channels_delivered.0,
            deleted_at: row.deleted_at,
        })
    }
}

/// Listing filter.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilter {
    #[serde(default)]
    pub unread_only: bool,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl ListFilter {
    fn validate(&self) -> Result<(), AppError> {
        match &self.kind {
            Some(kind) if !NotificationKind::NAMES.contains(&kind.as_str()) => Err(
                AppError::Validation(format!("Unknown notification type filter '{}'", kind)),
            ),
            _ => Ok(()),
        }
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub items: Vec<Notification>,
    /// Present when more rows exist past this page.
    pub next_cursor: Option<String>,
}

/// Result of a single-notification read-state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadUpdate {
    pub unread_count: i64,
    #[serde(skip)]
    pub read_at: Option<DateTime<Utc>>,
    /// `false` when the notification was already read (idempotent repeat).
    #[serde(skip)]
    pub changed: bool,
}

/// Result of marking everything read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadAllUpdate {
    pub updated: u64,
    pub unread_count: i64,
}

/// Result of a purge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeOutcome {
    /// `false` when the notification was already tombstoned.
    pub purged: bool,
    pub unread_count: i64,
}

/// Service layer for notification persistence and read-state.
pub struct NotificationService;

impl NotificationService {
    /// Persist a new notification. Fails with `InvalidRecipient` for unknown recipients.
    ///
    /// An empty channel list is accepted: the notification is still listed and
    /// counted in-app.
    pub async fn create(
        pool: &PgPool,
        recipient_id: Uuid,
        kind: &NotificationKind,
        channels: &[Channel],
    ) -> Result<Notification, AppError> {
        if !RecipientDirectory::exists(pool, recipient_id).await? {
            return Err(AppError::InvalidRecipient(format!(
                "Recipient {} does not exist",
                recipient_id
            )));
        }

        let requested: BTreeSet<Channel> = channels.iter().copied().collect();

        let row: NotificationRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO notifications (id, recipient_id, kind, payload, channels_requested)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(recipient_id)
        .bind(kind.name())
        .bind(Json(kind.payload()))
        .bind(Json(&requested))
        .fetch_one(pool)
        .await?;

        let notification = Notification::try_from(row)?;

        tracing::info!(
            notification_id = %notification.id,
            recipient_id = %recipient_id,
            kind = kind.name(),
            channels = ?requested,
            "Notification created"
        );

        Ok(notification)
    }

    /// Fetch a live notification owned by `recipient_id`.
    pub async fn get(
        pool: &PgPool,
        notification_id: Uuid,
        recipient_id: Uuid,
    ) -> Result<Notification, AppError> {
        let notification = Self::find(pool, notification_id)
            .await?
            .filter(|n| !n.is_tombstoned())
            .ok_or_else(|| not_found(notification_id))?;

        if notification.recipient_id != recipient_id {
            return Err(forbidden(notification_id));
        }

        Ok(notification)
    }

    /// Fetch a notification by id regardless of owner or tombstone (delivery path).
    pub async fn find(
        pool: &PgPool,
        notification_id: Uuid,
    ) -> Result<Option<Notification>, AppError> {
        let row: Option<NotificationRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM notifications WHERE id = $1"))
                .bind(notification_id)
                .fetch_optional(pool)
                .await?;

        row.map(Notification::try_from).transpose()
    }

    /// Count unread, non-tombstoned notifications for a recipient.
    pub async fn unread_count<'e, E: PgExecutor<'e>>(
        executor: E,
        recipient_id: Uuid,
    ) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM notifications
            WHERE recipient_id = $1
              AND read_at IS NULL
              AND deleted_at IS NULL
            "#,
        )
        .bind(recipient_id)
        .fetch_one(executor)
        .await?;

        Ok(count)
    }

    /// Mark one notification read and return the recipient's new unread count.
    ///
    /// Repeating the call on an already-read notification changes nothing and
    /// returns the same count.
    pub async fn mark_read(
        pool: &PgPool,
        notification_id: Uuid,
        recipient_id: Uuid,
    ) -> Result<ReadUpdate, AppError> {
        let mut tx = pool.begin().await?;

        Self::check_owner(&mut tx, notification_id, recipient_id, false).await?;
        RecipientDirectory::lock(&mut *tx, recipient_id).await?;

        let changed = sqlx::query(
            r#"
            UPDATE notifications
            SET read_at = NOW()
            WHERE id = $1
              AND read_at IS NULL
              AND deleted_at IS NULL
            "#,
        )
        .bind(notification_id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        let read_at: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT read_at FROM notifications WHERE id = $1")
                .bind(notification_id)
                .fetch_one(&mut *tx)
                .await?;

        let unread_count = Self::unread_count(&mut *tx, recipient_id).await?;
        tx.commit().await?;

        if changed {
            tracing::debug!(
                notification_id = %notification_id,
                recipient_id = %recipient_id,
                unread_count,
                "Notification marked read"
            );
        }

        Ok(ReadUpdate {
            unread_count,
            read_at,
            changed,
        })
    }

    /// Mark every unread notification of a recipient read, atomically.
    pub async fn mark_all_read(
        pool: &PgPool,
        recipient_id: Uuid,
    ) -> Result<ReadAllUpdate, AppError> {
        let mut tx = pool.begin().await?;

        RecipientDirectory::lock(&mut *tx, recipient_id).await?;

        let updated = sqlx::query(
            r#"
            UPDATE notifications
            SET read_at = NOW()
            WHERE recipient_id = $1
              AND read_at IS NULL
              AND deleted_at IS NULL
            "#,
        )
        .bind(recipient_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let unread_count = Self::unread_count(&mut *tx, recipient_id).await?;
        tx.commit().await?;

        tracing::info!(recipient_id = %recipient_id, updated, "Marked all notifications read");

        Ok(ReadAllUpdate {
            updated,
            unread_count,
        })
    }

    /// Tombstone a notification. It disappears from listings and counts and
    /// its unfinished delivery jobs are dropped. Idempotent.
    pub async fn purge(
        pool: &PgPool,
        notification_id: Uuid,
        recipient_id: Uuid,
    ) -> Result<PurgeOutcome, AppError> {
        let mut tx = pool.begin().await?;

        Self::check_owner(&mut tx, notification_id, recipient_id, true).await?;
        RecipientDirectory::lock(&mut *tx, recipient_id).await?;

        let purged = sqlx::query(
            "UPDATE notifications SET deleted_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(notification_id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        let cancelled = sqlx::query(
            r#"
            DELETE FROM delivery_jobs
            WHERE notification_id = $1
              AND status IN ('pending', 'in_flight')
            "#,
        )
        .bind(notification_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let unread_count = Self::unread_count(&mut *tx, recipient_id).await?;
        tx.commit().await?;

        if purged {
            tracing::info!(
                notification_id = %notification_id,
                cancelled_jobs = cancelled,
                "Notification purged"
            );
        }

        Ok(PurgeOutcome {
            purged,
            unread_count,
        })
    }

    /// Fetch one reverse-chronological page.
    pub async fn list(
        pool: &PgPool,
        recipient_id: Uuid,
        filter: &ListFilter,
        cursor: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Page, AppError> {
        filter.validate()?;
        let cursor = cursor.map(Cursor::decode).transpose()?;
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

        Self::fetch_page(pool, recipient_id, filter, cursor, limit).await
    }

    /// Lazily walk every matching notification, newest first.
    ///
    /// Pages are fetched on demand; dropping the stream stops fetching. A
    /// client can resume a walk later by passing the cursor of the last item
    /// it consumed.
    pub fn stream(
        pool: PgPool,
        recipient_id: Uuid,
        filter: ListFilter,
        start: Option<Cursor>,
        page_size: i64,
    ) -> impl Stream<Item = Result<Notification, AppError>> + Send + 'static {
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);

        // State: `None` once the last page has been emitted.
        stream::try_unfold(Some(start), move |state| {
            let pool = pool.clone();
            let filter = filter.clone();
            async move {
                let Some(cursor) = state else {
                    return Ok::<_, AppError>(None);
                };

                filter.validate()?;
                let page = Self::fetch_page(&pool, recipient_id, &filter, cursor, page_size).await?;
                let next = match page.next_cursor {
                    Some(_) => page.items.last().map(|n| Some(n.cursor())),
                    None => None,
                };

                let items = stream::iter(page.items.into_iter().map(Ok::<_, AppError>));
                Ok::<_, AppError>(Some((items, next)))
            }
        })
        .try_flatten()
    }

    /// Merge one channel outcome into `channels_delivered`.
    ///
    /// Entries are only ever added or upgraded; a recorded `sent` is never
    /// replaced.
    pub async fn record_delivery<'e, E: PgExecutor<'e>>(
        executor: E,
        notification_id: Uuid,
        channel: Channel,
        record: &DeliveryRecord,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET channels_delivered = channels_delivered || jsonb_build_object($2::text, $3::jsonb)
            WHERE id = $1
              AND (channels_delivered -> $2::text ->> 'status') IS DISTINCT FROM 'sent'
            "#,
        )
        .bind(notification_id)
        .bind(channel.as_str())
        .bind(Json(record))
        .execute(executor)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_dispatched<'e, E: PgExecutor<'e>>(
        executor: E,
        notification_id: Uuid,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE notifications SET dispatched_at = NOW() WHERE id = $1 AND dispatched_at IS NULL",
        )
        .bind(notification_id)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Live notifications whose dispatch never completed, oldest first.
    pub async fn find_undispatched(
        pool: &PgPool,
        older_than: chrono::Duration,
        limit: i64,
    ) -> Result<Vec<Uuid>, AppError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM notifications
            WHERE dispatched_at IS NULL
              AND deleted_at IS NULL
              AND created_at < $1
            ORDER BY created_at
            LIMIT $2
            "#,
        )
        .bind(Utc::now() - older_than)
        .bind(limit)
        .fetch_all(pool)
        .await?;

        Ok(ids)
    }

    async fn fetch_page(
        pool: &PgPool,
        recipient_id: Uuid,
        filter: &ListFilter,
        cursor: Option<Cursor>,
        limit: i64,
    ) -> Result<Page, AppError> {
        let rows: Vec<NotificationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {COLUMNS}
            FROM notifications
            WHERE recipient_id = $1
              AND deleted_at IS NULL
              AND ($2 = FALSE OR read_at IS NULL)
              AND ($3::text IS NULL OR kind = $3)
              AND ($4::timestamptz IS NULL OR (created_at, id) < ($4, $5::uuid))
            ORDER BY created_at DESC, id DESC
            LIMIT $6
            "#
        ))
        .bind(recipient_id)
        .bind(filter.unread_only)
        .bind(filter.kind.as_deref())
        .bind(cursor.map(|c| c.created_at))
        .bind(cursor.map(|c| c.id))
        .bind(limit + 1)
        .fetch_all(pool)
        .await?;

        let mut items = rows
            .into_iter()
            .map(Notification::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let has_more = items.len() as i64 > limit;
        items.truncate(limit as usize);

        let next_cursor = if has_more {
            items.last().map(|n| n.cursor().encode())
        } else {
            None
        };

        Ok(Page { items, next_cursor })
    }

    /// Resolve ownership inside a transaction: `NotFound` for missing rows
    /// (and tombstoned ones unless `allow_tombstoned`), `Forbidden` for
    /// another recipient's row.
    async fn check_owner(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        notification_id: Uuid,
        recipient_id: Uuid,
        allow_tombstoned: bool,
    ) -> Result<(), AppError> {
        let row: Option<(Uuid, Option<DateTime<Utc>>)> =
            sqlx::query_as("SELECT recipient_id, deleted_at FROM notifications WHERE id = $1")
                .bind(notification_id)
                .fetch_optional(&mut **tx)
                .await?;

        match row {
            None => Err(not_found(notification_id)),
            Some((_, Some(_))) if !allow_tombstoned => Err(not_found(notification_id)),
            Some((owner, _)) if owner != recipient_id => Err(forbidden(notification_id)),
            Some(_) => Ok(()),
        }
    }
}

fn not_found(notification_id: Uuid) -> AppError {
    AppError::NotFound(format!("Notification {} not found", notification_id))
}

fn forbidden(notification_id: Uuid) -> AppError {
    AppError::Forbidden(format!(
        "Not authorized to access notification {}",
        notification_id
    ))
}
