//! Read-only access to recipient rows owned by the surrounding platform.

use sqlx::PgPool;
use sqlx::postgres::PgExecutor;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::Recipient;

pub struct RecipientDirectory;

impl RecipientDirectory {
    pub async fn get(pool: &PgPool, recipient_id: Uuid) -> Result<Option<Recipient>, AppError> {
        let recipient: Option<Recipient> = sqlx::query_as(
            "SELECT id, email, locale, created_at FROM recipients WHERE id = $1",
        )
        .bind(recipient_id)
        .fetch_optional(pool)
        .await?;

        Ok(recipient)
    }

    pub async fn exists<'e, E: PgExecutor<'e>>(
        executor: E,
        recipient_id: Uuid,
    ) -> Result<bool, AppError> {
        let found: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM recipients WHERE id = $1")
            .bind(recipient_id)
            .fetch_optional(executor)
            .await?;

        Ok(found.is_some())
    }

    /// Take the per-recipient row lock for the rest of the transaction.
    ///
    /// Every read-state mutation for a recipient goes through this lock, so
    /// concurrent actions from several tabs apply one after another and each
    /// sees the count left by the previous one. Returns `false` when the
    /// recipient does not exist.
    pub async fn lock<'e, E: PgExecutor<'e>>(
        executor: E,
        recipient_id: Uuid,
    ) -> Result<bool, AppError> {
        let locked: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM recipients WHERE id = $1 FOR UPDATE")
                .bind(recipient_id)
                .fetch_optional(executor)
                .await?;

        Ok(locked.is_some())
    }
}
