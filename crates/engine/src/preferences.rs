//! Preference store: per-recipient channel opt-in/out, per-type overrides
//! and digest frequency.
//!
//! A recipient without a stored row has every channel enabled. Updates are
//! partial: only the keys present in a [`PreferenceUpdate`] change.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::payload::NotificationKind;
use courier_common::types::{Channel, DigestFrequency};

use crate::recipients::RecipientDirectory;

/// Effective delivery preferences of one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preference {
    pub recipient_id: Uuid,
    /// Channel flags. Missing channels are enabled.
    pub channels: BTreeMap<Channel, bool>,
    /// `type → channel → enabled`, taking precedence over `channels`.
    pub type_overrides: BTreeMap<String, BTreeMap<Channel, bool>>,
    pub digest: DigestFrequency,
}

/// Partial preference change.
///
/// In `typeOverrides`, a `null` channel value removes that override so the
/// channel flag applies again.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferenceUpdate {
    #[serde(default)]
    pub channels: BTreeMap<Channel, bool>,
    #[serde(default)]
    pub type_overrides: BTreeMap<String, BTreeMap<Channel, Option<bool>>>,
    #[serde(default)]
    pub digest: Option<DigestFrequency>,
}

impl Preference {
    /// All channels enabled, immediate delivery.
    pub fn default_for(recipient_id: Uuid) -> Self {
        Self {
            recipient_id,
            channels: BTreeMap::new(),
            type_overrides: BTreeMap::new(),
            digest: DigestFrequency::Immediate,
        }
    }

    pub fn channel_enabled(&self, channel: Channel) -> bool {
        self.channels.get(&channel).copied().unwrap_or(true)
    }

    /// Whether `channel` may carry notifications of type `kind`.
    pub fn allows(&self, kind: &str, channel: Channel) -> bool {
        self.type_overrides
            .get(kind)
            .and_then(|overrides| overrides.get(&channel))
            .copied()
            .unwrap_or_else(|| self.channel_enabled(channel))
    }

    /// Apply a partial update; keys absent from `update` keep their value.
    pub fn merge(&mut self, update: &PreferenceUpdate) {
        for (channel, enabled) in &update.channels {
            self.channels.insert(*channel, *enabled);
        }

        for (kind, overrides) in &update.type_overrides {
            let entry = self.type_overrides.entry(kind.clone()).or_default();
            for (channel, value) in overrides {
                match value {
                    Some(enabled) => {
                        entry.insert(*channel, *enabled);
                    }
                    None => {
                        entry.remove(channel);
                    }
                }
            }
            if entry.is_empty() {
                self.type_overrides.remove(kind);
            }
        }

        if let Some(digest) = update.digest {
            self.digest = digest;
        }
    }
}

impl PreferenceUpdate {
    fn validate(&self) -> Result<(), AppError> {
        if let Some(kind) = self
            .type_overrides
            .keys()
            .find(|kind| !NotificationKind::NAMES.contains(&kind.as_str()))
        {
            return Err(AppError::InvalidType(format!(
                "Unknown notification type '{}' in typeOverrides",
                kind
            )));
        }
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PreferenceRow {
    recipient_id: Uuid,
    channels: Json<BTreeMap<Channel, bool>>,
    type_overrides: Json<BTreeMap<String, BTreeMap<Channel, bool>>>,
    digest: DigestFrequency,
}

impl From<PreferenceRow> for Preference {
    fn from(row: PreferenceRow) -> Self {
        Self {
            recipient_id: row.recipient_id,
            channels: row.channels.0,
            type_overrides: row.type_overrides.0,
            digest: row.digest,
        }
    }
}

/// Service layer for preference reads and partial updates.
pub struct PreferenceService;

impl PreferenceService {
    /// Load preferences, defaulting to everything enabled.
    pub async fn get(pool: &PgPool, recipient_id: Uuid) -> Result<Preference, AppError> {
        let row: Option<PreferenceRow> = sqlx::query_as(
            r#"
            SELECT recipient_id, channels, type_overrides, digest
            FROM preferences
            WHERE recipient_id = $1
            "#,
        )
        .bind(recipient_id)
        .fetch_optional(pool)
        .await?;

        Ok(row
            .map(Preference::from)
            .unwrap_or_else(|| Preference::default_for(recipient_id)))
    }

    /// Merge a partial update into the stored preferences.
    pub async fn update(
        pool: &PgPool,
        recipient_id: Uuid,
        update: &PreferenceUpdate,
    ) -> Result<Preference, AppError> {
        update.validate()?;

        let mut tx = pool.begin().await?;

        // Serializes concurrent merges, including the very first one.
        if !RecipientDirectory::lock(&mut *tx, recipient_id).await? {
            return Err(AppError::NotFound(format!(
                "Recipient {} not found",
                recipient_id
            )));
        }

        let existing: Option<PreferenceRow> = sqlx::query_as(
            r#"
            SELECT recipient_id, channels, type_overrides, digest
            FROM preferences
            WHERE recipient_id = $1
            "#,
        )
        .bind(recipient_id)
        .fetch_optional(&mut *tx)
        .await?;

        let mut preference = existing
            .map(Preference::from)
            .unwrap_or_else(|| Preference::default_for(recipient_id));
        preference.merge(update);

        sqlx::query(
            r#"
            INSERT INTO preferences (recipient_id, channels, type_overrides, digest, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (recipient_id) DO UPDATE
            SET channels = EXCLUDED.channels,
                type_overrides = EXCLUDED.type_overrides,
                digest = EXCLUDED.digest,
                updated_at = NOW()
            "#,
        )
        .bind(recipient_id)
        .bind(Json(&preference.channels))
        .bind(Json(&preference.type_overrides))
        .bind(preference.digest)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            recipient_id = %recipient_id,
            digest = %preference.digest,
            "Preferences updated"
        );

        Ok(preference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_absent_preference_enables_everything() {
        let pref = Preference::default_for(Uuid::new_v4());
        for channel in Channel::ALL {
            assert!(pref.channel_enabled(channel));
            assert!(pref.allows("application-status", channel));
        }
    }

    #[test]
    fn test_merge_keeps_unspecified_channels() {
        let mut pref = Preference::default_for(Uuid::new_v4());
        pref.merge(&serde_json::from_value(json!({ "channels": { "email": false } })).unwrap());
        pref.merge(&serde_json::from_value(json!({ "channels": { "push": false } })).unwrap());

        assert!(!pref.channel_enabled(Channel::Email));
        assert!(!pref.channel_enabled(Channel::Push));
        assert!(pref.channel_enabled(Channel::Realtime));
    }

    #[test]
    fn test_type_override_beats_channel_flag() {
        let mut pref = Preference::default_for(Uuid::new_v4());
        pref.merge(
            &serde_json::from_value(json!({
                "channels": { "email": false },
                "typeOverrides": { "interview-scheduled": { "email": true } }
            }))
            .unwrap(),
        );

        assert!(pref.allows("interview-scheduled", Channel::Email));
        assert!(!pref.allows("job-recommendation", Channel::Email));
    }

    #[test]
    fn test_null_override_removes_it() {
        let mut pref = Preference::default_for(Uuid::new_v4());
        pref.merge(
            &serde_json::from_value(json!({
                "typeOverrides": { "new-message": { "push": false } }
            }))
            .unwrap(),
        );
        assert!(!pref.allows("new-message", Channel::Push));

        pref.merge(
            &serde_json::from_value(json!({
                "typeOverrides": { "new-message": { "push": null } }
            }))
            .unwrap(),
        );
        assert!(pref.allows("new-message", Channel::Push));
        assert!(pref.type_overrides.is_empty());
    }

    #[test]
    fn test_digest_only_changes_when_given() {
        let mut pref = Preference::default_for(Uuid::new_v4());
        pref.merge(&serde_json::from_value(json!({ "digest": "daily" })).unwrap());
        assert_eq!(pref.digest, DigestFrequency::Daily);

        pref.merge(&PreferenceUpdate::default());
        assert_eq!(pref.digest, DigestFrequency::Daily);
    }

    #[test]
    fn test_unknown_override_type_rejected() {
        let update: PreferenceUpdate = serde_json::from_value(json!({
            "typeOverrides": { "promo": { "email": false } }
        }))
        .unwrap();
        assert!(matches!(update.validate(), Err(AppError::InvalidType(_))));
    }
}
