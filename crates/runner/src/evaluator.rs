//! Decides whether a fetched batch warrants an alert and renders it.
//!
//! The suspicious-sign-in predicate runs server-side in the event query, so
//! every fetched event is a match. Evaluation never drops an event for a
//! missing optional field; those render as the placeholder instead.

use chrono::{DateTime, SecondsFormat, Utc};

use signwatch_core::SignInEvent;
use signwatch_notify::{AlertContext, AlertTemplates, EventLine, Notification, SendError};

/// Everything needed to turn matches into a notification.
#[derive(Debug, Clone)]
pub struct AlertFormat {
    pub region: String,
    pub recipients: Vec<String>,
    pub templates: AlertTemplates,
}

impl AlertFormat {
    pub fn new(region: impl Into<String>, recipients: Vec<String>, templates: AlertTemplates) -> Self {
        Self {
            region: region.into(),
            recipients,
            templates,
        }
    }
}

/// Result of evaluating one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertDecision {
    pub matched: Vec<SignInEvent>,
}

pub fn evaluate(events: Vec<SignInEvent>) -> AlertDecision {
    AlertDecision { matched: events }
}

impl AlertDecision {
    pub fn should_notify(&self) -> bool {
        !self.matched.is_empty()
    }

    pub fn len(&self) -> usize {
        self.matched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matched.is_empty()
    }

    /// Render the alert, or `None` for an empty batch.
    pub fn notification(
        &self,
        format: &AlertFormat,
        now: DateTime<Utc>,
    ) -> Result<Option<Notification>, SendError> {
        if !self.should_notify() {
            return Ok(None);
        }

        let ctx = AlertContext {
            region: format.region.clone(),
            count: self.matched.len(),
            events: self.matched.iter().map(EventLine::from_event).collect(),
            now: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        let (subject, body) = format.templates.render(&ctx)?;

        Ok(Some(Notification {
            recipients: format.recipients.clone(),
            subject,
            body,
        }))
    }
}
