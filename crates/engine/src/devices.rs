//! Device token store for mobile/web push.

use sqlx::PgPool;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{DeviceToken, Platform};

/// Upper bound on accepted token length; real tokens are far shorter.
const MAX_TOKEN_LEN: usize = 4096;

/// Service layer for device token registration and pruning.
pub struct DeviceTokenService;

impl DeviceTokenService {
    /// Register (or re-register) a token for a recipient.
    ///
    /// Tokens are globally unique; registering a token already held by
    /// another recipient moves it.
    pub async fn register(
        pool: &PgPool,
        recipient_id: Uuid,
        platform: Platform,
        token: &str,
    ) -> Result<DeviceToken, AppError> {
        let token = token.trim();
        if token.is_empty() || token.len() > MAX_TOKEN_LEN {
            return Err(AppError::Validation(
                "Device token must be between 1 and 4096 characters".to_string(),
            ));
        }

        let device: DeviceToken = sqlx::query_as(
            r#"
            INSERT INTO device_tokens (token, recipient_id, platform)
            VALUES ($1, $2, $3)
            ON CONFLICT (token) DO UPDATE
            SET recipient_id = EXCLUDED.recipient_id,
                platform = EXCLUDED.platform,
                last_validated_at = NOW()
            RETURNING recipient_id, platform, token, registered_at, last_validated_at
            "#,
        )
        .bind(token)
        .bind(recipient_id)
        .bind(platform)
        .fetch_one(pool)
        .await?;

        tracing::info!(recipient_id = %recipient_id, platform = %platform, "Device token registered");

        Ok(device)
    }

    /// Remove a recipient's token. Returns `true` if it was registered.
    pub async fn unregister(
        pool: &PgPool,
        recipient_id: Uuid,
        token: &str,
    ) -> Result<bool, AppError> {
        let result =
            sqlx::query("DELETE FROM device_tokens WHERE token = $1 AND recipient_id = $2")
                .bind(token)
                .bind(recipient_id)
                .execute(pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_for_recipient(
        pool: &PgPool,
        recipient_id: Uuid,
    ) -> Result<Vec<DeviceToken>, AppError> {
        let tokens: Vec<DeviceToken> = sqlx::query_as(
            r#"
            SELECT recipient_id, platform, token, registered_at, last_validated_at
            FROM device_tokens
            WHERE recipient_id = $1
            ORDER BY registered_at
            "#,
        )
        .bind(recipient_id)
        .fetch_all(pool)
        .await?;

        Ok(tokens)
    }

    /// Prune a token the push transport reported as invalid.
    pub async fn prune(pool: &PgPool, token: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM device_tokens WHERE token = $1")
            .bind(token)
            .execute(pool)
            .await?;

        let pruned = result.rows_affected() > 0;
        if pruned {
            tracing::info!("Pruned invalid device token");
        }
        Ok(pruned)
    }

    /// Refresh `last_validated_at` for tokens the transport accepted.
    pub async fn mark_validated(pool: &PgPool, tokens: &[String]) -> Result<(), AppError> {
        if tokens.is_empty() {
            return Ok(());
        }

        sqlx::query("UPDATE device_tokens SET last_validated_at = NOW() WHERE token = ANY($1)")
            .bind(tokens)
            .execute(pool)
            .await?;

        Ok(())
    }
}
