//! Notifier trait definition and shared error types.

/// Errors that can occur during notification delivery.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("mail endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("SMTP delivery failed: {0}")]
    Smtp(String),

    #[error("Template rendering failed: {0}")]
    Template(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("could not authenticate mail request: {0}")]
    Auth(String),

    #[error("delivery timed out after {0}ms")]
    Timeout(u64),
}

/// A rendered notification ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Notification {
    pub recipients: Vec<String>,
    /// The rendered subject line.
    pub subject: String,
    /// The rendered plain-text body.
    pub body: String,
}

/// Trait for notification channel implementations.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a notification through this channel.
    async fn send(&self, notification: &Notification) -> Result<(), SendError>;

    /// Human-readable name for this channel (e.g., "graph", "email").
    fn channel_name(&self) -> &str;
}
