//! Minijinja template rendering for alert messages.
//!
//! Subject and body are arbitrary template strings, so a fresh
//! [`minijinja::Environment`] is created per render call.

use signwatch_core::SignInEvent;

use crate::traits::SendError;

pub const DEFAULT_SUBJECT_TEMPLATE: &str = "[Alert] {{ count }} suspicious sign-ins detected";

pub const DEFAULT_BODY_TEMPLATE: &str = "Suspicious sign-ins detected outside {{ region }}:\n\n\
{% for e in events %}- User: {{ e.display_name }} ({{ e.user }}), Location: {{ e.city }}, Time: {{ e.time }}\n{% endfor %}";

/// One sign-in as exposed to templates. Missing fields are already
/// replaced by the placeholder.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EventLine {
    pub user: String,
    pub display_name: String,
    pub city: String,
    pub country: String,
    pub time: String,
    pub ip_address: String,
    pub app: String,
}

impl EventLine {
    pub fn from_event(event: &SignInEvent) -> Self {
        let placeholder = || signwatch_core::PLACEHOLDER.to_string();
        Self {
            user: event.subject().to_string(),
            display_name: event.display_name().to_string(),
            city: event.city().to_string(),
            country: event.region().map(String::from).unwrap_or_else(placeholder),
            time: event.created().to_string(),
            ip_address: event.ip_address.clone().unwrap_or_else(placeholder),
            app: event.app_display_name.clone().unwrap_or_else(placeholder),
        }
    }
}

/// Context data available to alert templates.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AlertContext {
    /// Allow-listed region the sign-ins came from outside of.
    pub region: String,
    pub count: usize,
    pub events: Vec<EventLine>,
    /// Render time in ISO 8601 format.
    pub now: String,
}

/// Subject and body templates for alert mails.
#[derive(Debug, Clone)]
pub struct AlertTemplates {
    subject: String,
    body: String,
}

impl Default for AlertTemplates {
    fn default() -> Self {
        Self {
            subject: DEFAULT_SUBJECT_TEMPLATE.to_string(),
            body: DEFAULT_BODY_TEMPLATE.to_string(),
        }
    }
}

impl AlertTemplates {
    /// Build from optional overrides, validating syntax up front.
    pub fn new(subject: Option<String>, body: Option<String>) -> Result<Self, SendError> {
        let templates = Self {
            subject: subject.unwrap_or_else(|| DEFAULT_SUBJECT_TEMPLATE.to_string()),
            body: body.unwrap_or_else(|| DEFAULT_BODY_TEMPLATE.to_string()),
        };
        validate(&templates.subject)
            .map_err(|e| SendError::Config(format!("invalid subject template: {e}")))?;
        validate(&templates.body)
            .map_err(|e| SendError::Config(format!("invalid body template: {e}")))?;
        Ok(templates)
    }

    /// Render `(subject, body)`.
    pub fn render(&self, ctx: &AlertContext) -> Result<(String, String), SendError> {
        let subject = render(&self.subject, ctx)?;
        let body = render(&self.body, ctx)?;
        // Mail headers cannot carry line breaks.
        let subject = subject.lines().map(str::trim).collect::<Vec<_>>().join(" ");
        Ok((subject.trim().to_string(), body))
    }
}

/// Build a configured minijinja environment with custom filters and globals.
fn build_env() -> minijinja::Environment<'static> {
    let mut env = minijinja::Environment::new();
    env.add_filter("lower", lower_filter);
    env.add_filter("upper", upper_filter);
    env.add_function("env", env_function);
    env
}

fn render(template_str: &str, ctx: &AlertContext) -> Result<String, SendError> {
    build_env()
        .render_str(template_str, ctx)
        .map_err(|e| SendError::Template(e.to_string()))
}

/// Check that a template parses, without evaluating it.
fn validate(template_str: &str) -> Result<(), SendError> {
    let env = build_env();
    env.template_from_str(template_str)
        .map_err(|e| SendError::Template(e.to_string()))?;
    Ok(())
}

fn lower_filter(value: String) -> String {
    value.to_lowercase()
}

fn upper_filter(value: String) -> String {
    value.to_uppercase()
}

/// Global function: read an environment variable by name.
///
/// Returns an empty string (and logs a warning) when the variable is unset.
fn env_function(name: String) -> String {
    match std::env::var(&name) {
        Ok(val) => val,
        Err(_) => {
            tracing::warn!(var = %name, "Environment variable not found, returning empty string");
            String::new()
        }
    }
}
