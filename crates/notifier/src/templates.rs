//! Email templates keyed by `(notification type, locale)`, rendered with
//! Handlebars in strict mode.
//!
//! Placeholders are camelCase payload keys (`{{jobId}}`). A placeholder whose
//! field is absent fails the render, unless the template lists that field as
//! optional, in which case it renders empty.

use std::collections::{BTreeMap, HashMap};

use handlebars::Handlebars;
use serde_json::{Map, Value};
use thiserror::Error;

use courier_common::error::ChannelError;

/// Locale every lookup falls back to.
pub const FALLBACK_LOCALE: &str = "en";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template not found: {kind} ({locale})")]
    NotFound { kind: String, locale: String },

    #[error("invalid template {name}: {reason}")]
    Invalid { name: String, reason: String },

    #[error("render error: {0}")]
    Render(String),
}

impl From<TemplateError> for ChannelError {
    fn from(err: TemplateError) -> Self {
        ChannelError::Permanent(err.to_string())
    }
}

/// Template source as registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailTemplate {
    pub subject: String,
    pub body: String,
    pub optional: Vec<String>,
}

impl EmailTemplate {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            optional: Vec::new(),
        }
    }

    /// Fields that render empty instead of failing when absent.
    pub fn optional(mut self, fields: &[&str]) -> Self {
        self.optional = fields.iter().map(|f| f.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub body: String,
}

/// A registered template: the Handlebars names of its parts.
#[derive(Debug, Clone)]
pub struct TemplateEntry {
    pub locale: String,
    subject: String,
    body: String,
    optional: Vec<String>,
}

pub struct TemplateRegistry {
    engine: Handlebars<'static>,
    templates: HashMap<(String, String), TemplateEntry>,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRegistry {
    pub fn new() -> Self {
        let mut engine = Handlebars::new();
        engine.set_strict_mode(true);
        // Plain-text mail.
        engine.register_escape_fn(handlebars::no_escape);

        Self {
            engine,
            templates: HashMap::new(),
        }
    }

    pub fn insert(
        &mut self,
        kind: &str,
        locale: &str,
        template: EmailTemplate,
    ) -> Result<(), TemplateError> {
        let locale = locale.to_lowercase();
        let subject = format!("{}/{}/subject", kind, locale);
        let body = format!("{}/{}/body", kind, locale);

        for (name, source) in [(&subject, &template.subject), (&body, &template.body)] {
            self.engine
                .register_template_string(name, source)
                .map_err(|e| TemplateError::Invalid {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
        }

        self.templates.insert(
            (kind.to_string(), locale.clone()),
            TemplateEntry {
                locale,
                subject,
                body,
                optional: template.optional,
            },
        );
        Ok(())
    }

    /// Exact locale, then its language part (`pt-br` → `pt`), then [`FALLBACK_LOCALE`].
    pub fn lookup(&self, kind: &str, locale: &str) -> Result<&TemplateEntry, TemplateError> {
        let locale = locale.to_lowercase();
        let language = locale.split(['-', '_']).next().unwrap_or(FALLBACK_LOCALE);

        let found = [locale.as_str(), language, FALLBACK_LOCALE]
            .into_iter()
            .find_map(|candidate| {
                self.templates
                    .get(&(kind.to_string(), candidate.to_string()))
            });

        found.ok_or_else(|| TemplateError::NotFound {
            kind: kind.to_string(),
            locale: locale.clone(),
        })
    }

    pub fn render(
        &self,
        kind: &str,
        locale: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<RenderedEmail, TemplateError> {
        let entry = self.lookup(kind, locale)?;

        let mut data: Map<String, Value> = fields
            .iter()
            .map(|(key, value)| (key.clone(), Value::String(value.clone())))
            .collect();
        for field in &entry.optional {
            data.entry(field.clone())
                .or_insert_with(|| Value::String(String::new()));
        }
        let data = Value::Object(data);

        let render = |name: &str| {
            self.engine
                .render(name, &data)
                .map_err(|e| TemplateError::Render(e.to_string()))
        };

        Ok(RenderedEmail {
            subject: render(&entry.subject)?,
            body: render(&entry.body)?,
        })
    }

    /// Built-in templates for every type that may be emailed.
    pub fn with_defaults() -> Result<Self, TemplateError> {
        let mut registry = Self::new();

        registry.insert(
            "application-status",
            "en",
            EmailTemplate::new(
                "Update on your application",
                "Your application for job {{jobId}} has a new status: {{status}}.\n\
                 Sign in to see the details.",
            )
            .optional(&["status"]),
        )?;
        registry.insert(
            "interview-scheduled",
            "en",
            EmailTemplate::new(
                "Interview scheduled",
                "Your interview for job {{jobId}} is scheduled for {{scheduledAt}}.\n\
                 Location: {{location}}",
            )
            .optional(&["location"]),
        )?;
        registry.insert(
            "job-recommendation",
            "en",
            EmailTemplate::new(
                "{{jobTitle}} at {{company}}",
                "We think you'd be a great fit for {{jobTitle}} at {{company}}.",
            ),
        )?;
        registry.insert(
            "system-announcement",
            "en",
            EmailTemplate::new("{{title}}", "{{body}}"),
        )?;

        registry.insert(
            "application-status",
            "es",
            EmailTemplate::new(
                "Novedades sobre tu candidatura",
                "Tu candidatura al empleo {{jobId}} tiene un nuevo estado: {{status}}.",
            )
            .optional(&["status"]),
        )?;
        registry.insert(
            "interview-scheduled",
            "es",
            EmailTemplate::new(
                "Entrevista programada",
                "Tu entrevista para el empleo {{jobId}} es el {{scheduledAt}}.\n\
                 Lugar: {{location}}",
            )
            .optional(&["location"]),
        )?;

        Ok(registry)
    }
}
