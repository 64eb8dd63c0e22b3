use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A distinct delivery mechanism.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Realtime,
    Email,
    Push,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Realtime, Channel::Email, Channel::Push];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Realtime => "realtime",
            Channel::Email => "email",
            Channel::Push => "push",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "realtime" => Ok(Channel::Realtime),
            "email" => Ok(Channel::Email),
            "push" => Ok(Channel::Push),
            other => Err(format!(
                "Invalid channel '{}'. Valid channels: realtime, email, push",
                other
            )),
        }
    }
}

/// Final per-channel outcome recorded on a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One entry of `Notification::channels_delivered`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub status: DeliveryStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DeliveryRecord {
    pub fn sent(at: DateTime<Utc>) -> Self {
        Self {
            status: DeliveryStatus::Sent,
            at,
            reason: None,
        }
    }

    pub fn failed(at: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            status: DeliveryStatus::Failed,
            at,
            reason: Some(reason.into()),
        }
    }
}

/// Delivery job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::InFlight => write!(f, "in_flight"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Push device platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Web,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Ios => write!(f, "ios"),
            Platform::Android => write!(f, "android"),
            Platform::Web => write!(f, "web"),
        }
    }
}

/// How often batched (non-immediate) email delivery happens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DigestFrequency {
    #[default]
    Immediate,
    Hourly,
    Daily,
}

impl std::fmt::Display for DigestFrequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DigestFrequency::Immediate => write!(f, "immediate"),
            DigestFrequency::Hourly => write!(f, "hourly"),
            DigestFrequency::Daily => write!(f, "daily"),
        }
    }
}

/// A notification recipient, provisioned by the surrounding platform.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub id: Uuid,
    pub email: Option<String>,
    pub locale: String,
    pub created_at: DateTime<Utc>,
}

/// A registered push token.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DeviceToken {
    pub recipient_id: Uuid,
    pub platform: Platform,
    pub token: String,
    pub registered_at: DateTime<Utc>,
    pub last_validated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_round_trip_strings() {
        for channel in Channel::ALL {
            assert_eq!(channel.as_str().parse::<Channel>().unwrap(), channel);
        }
        assert!("sms".parse::<Channel>().is_err());
    }

    #[test]
    fn test_delivery_record_serialization_omits_empty_reason() {
        let record = DeliveryRecord::sent(Utc::now());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "sent");
        assert!(json.get("reason").is_none());

        let failed = DeliveryRecord::failed(Utc::now(), "bounced");
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["reason"], "bounced");
    }

    #[test]
    fn test_job_status_display_matches_storage() {
        assert_eq!(JobStatus::InFlight.to_string(), "in_flight");
        assert_eq!(DigestFrequency::default(), DigestFrequency::Immediate);
    }
}
