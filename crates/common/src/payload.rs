//! Typed notification payloads.
//!
//! Every notification type carries its own payload schema. Producers send the
//! type name and a JSON payload; [`NotificationKind::parse`] turns that pair
//! into a validated variant at ingestion time, and the rest of the pipeline
//! only ever sees the typed form.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::AppError;
use crate::types::Channel;

/// A notification's type together with its payload.
///
/// Serializes as `{"type": "application-status", "payload": {"jobId": ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum NotificationKind {
    ApplicationStatus {
        job_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        application_id: Option<String>,
    },
    InterviewScheduled {
        job_id: String,
        scheduled_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<String>,
    },
    NewMessage {
        conversation_id: String,
        sender_name: String,
        preview: String,
    },
    JobRecommendation {
        job_id: String,
        job_title: String,
        company: String,
    },
    SystemAnnouncement {
        title: String,
        body: String,
    },
}

impl NotificationKind {
    /// Valid type names, matching the serialized `type` tag.
    pub const NAMES: &[&str] = &[
        "application-status",
        "interview-scheduled",
        "new-message",
        "job-recommendation",
        "system-announcement",
    ];

    /// Build a typed notification from a producer-supplied type name and payload.
    ///
    /// Unknown type names fail with `InvalidType`; payloads that do not match
    /// the type's schema fail with `Validation`.
    pub fn parse(kind: &str, payload: Value) -> Result<Self, AppError> {
        if !Self::NAMES.contains(&kind) {
            return Err(AppError::InvalidType(format!(
                "Unknown notification type '{}'. Valid types: {}",
                kind,
                Self::NAMES.join(", ")
            )));
        }

        let parsed: NotificationKind =
            serde_json::from_value(json!({ "type": kind, "payload": payload })).map_err(|e| {
                AppError::Validation(format!("Invalid payload for '{}': {}", kind, e))
            })?;

        parsed.validate()?;
        Ok(parsed)
    }

    /// Reassemble a stored `(type, payload)` pair. Stored rows were validated on write.
    pub fn from_stored(kind: &str, payload: Value) -> Result<Self, AppError> {
        serde_json::from_value(json!({ "type": kind, "payload": payload })).map_err(|e| {
            AppError::Internal(format!("Corrupt stored payload for '{}': {}", kind, e))
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            NotificationKind::ApplicationStatus { .. } => "application-status",
            NotificationKind::InterviewScheduled { .. } => "interview-scheduled",
            NotificationKind::NewMessage { .. } => "new-message",
            NotificationKind::JobRecommendation { .. } => "job-recommendation",
            NotificationKind::SystemAnnouncement { .. } => "system-announcement",
        }
    }

    /// The bare payload object, as stored in the `payload` column.
    pub fn payload(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove("payload").unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// Channels this type may ever be delivered on, before preferences apply.
    pub fn permitted_channels(&self) -> &'static [Channel] {
        match self {
            NotificationKind::NewMessage { .. } => &[Channel::Realtime, Channel::Push],
            NotificationKind::SystemAnnouncement { .. } => &[Channel::Realtime, Channel::Email],
            _ => &Channel::ALL,
        }
    }

    /// Flatten the payload into string fields for template rendering.
    ///
    /// Absent optional fields are omitted so templates can detect them.
    pub fn fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        if let Value::Object(map) = self.payload() {
            for (key, value) in map {
                let rendered = match value {
                    Value::Null => continue,
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                fields.insert(key, rendered);
            }
        }
        fields
    }

    /// Human-readable title and body, used for push and plain-text fallbacks.
    pub fn summary(&self) -> (String, String) {
        match self {
            NotificationKind::ApplicationStatus { job_id, status, .. } => {
                let body = match status {
                    Some(status) => format!("Your application for job {} is now {}", job_id, status),
                    None => format!("Your application for job {} was updated", job_id),
                };
                ("Application update".to_string(), body)
            }
            NotificationKind::InterviewScheduled {
                job_id,
                scheduled_at,
                location,
            } => {
                let when = scheduled_at.format("%Y-%m-%d %H:%M UTC");
                let body = match location {
                    Some(location) => format!(
                        "Interview for job {} on {} at {}",
                        job_id, when, location
                    ),
                    None => format!("Interview for job {} on {}", job_id, when),
                };
                ("Interview scheduled".to_string(), body)
            }
            NotificationKind::NewMessage {
                sender_name,
                preview,
                ..
            } => (format!("New message from {}", sender_name), preview.clone()),
            NotificationKind::JobRecommendation {
                job_title, company, ..
            } => (
                "Recommended job".to_string(),
                format!("{} at {}", job_title, company),
            ),
            NotificationKind::SystemAnnouncement { title, body } => (title.clone(), body.clone()),
        }
    }

    fn validate(&self) -> Result<(), AppError> {
        let required: Vec<(&str, &str)> = match self {
            NotificationKind::ApplicationStatus { job_id, .. }
            | NotificationKind::InterviewScheduled { job_id, .. } => {
                vec![("jobId", job_id.as_str())]
            }
            NotificationKind::NewMessage {
                conversation_id,
                sender_name,
                preview,
            } => vec![
                ("conversationId", conversation_id.as_str()),
                ("senderName", sender_name.as_str()),
                ("preview", preview.as_str()),
            ],
            NotificationKind::JobRecommendation {
                job_id,
                job_title,
                company,
            } => vec![
                ("jobId", job_id.as_str()),
                ("jobTitle", job_title.as_str()),
                ("company", company.as_str()),
            ],
            NotificationKind::SystemAnnouncement { title, body } => {
                vec![("title", title.as_str()), ("body", body.as_str())]
            }
        };

        if let Some((field, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(AppError::Validation(format!(
                "Field '{}' of '{}' must not be empty",
                field,
                self.name()
            )));
        }
        Ok(())
    }
}
