//! Microsoft Graph `sendMail` notifier.
//!
//! Posts the alert as a plain-text message from the configured sender
//! mailbox, authenticating with the same app credentials used to read
//! the audit log.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use url::Url;

use signwatch_source::CredentialProvider;

use crate::traits::{Notification, Notifier, SendError};

/// Sends notifications through `POST /v1.0/users/{sender}/sendMail`.
pub struct GraphMailNotifier {
    /// Fully built sendMail URL for the sender mailbox.
    url: Url,
    sender: String,
    credentials: Arc<dyn CredentialProvider>,
    /// Shared HTTP client (connection pooling).
    client: reqwest::Client,
}

impl std::fmt::Debug for GraphMailNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphMailNotifier")
            .field("url", &self.url.as_str())
            .field("sender", &self.sender)
            .finish()
    }
}

impl GraphMailNotifier {
    /// Create a notifier sending as `sender` via the Graph host at `base_url`.
    pub fn new(
        base_url: &str,
        sender: &str,
        credentials: Arc<dyn CredentialProvider>,
        timeout: Duration,
    ) -> Result<Self, SendError> {
        if sender.trim().is_empty() {
            return Err(SendError::Config("sender address must not be empty".to_string()));
        }

        let mut url = Url::parse(base_url)
            .map_err(|e| SendError::Config(format!("invalid Graph base URL '{base_url}': {e}")))?;
        url.path_segments_mut()
            .map_err(|_| SendError::Config(format!("Graph base URL cannot be a base: {base_url}")))?
            .pop_if_empty()
            .extend(["v1.0", "users", sender.trim(), "sendMail"]);

        Ok(Self {
            url,
            sender: sender.trim().to_string(),
            credentials,
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

/// Graph message payload for a plain-text mail.
fn message_payload(notification: &Notification) -> serde_json::Value {
    let recipients: Vec<serde_json::Value> = notification
        .recipients
        .iter()
        .map(|address| json!({ "emailAddress": { "address": address } }))
        .collect();

    json!({
        "message": {
            "subject": notification.subject,
            "body": { "contentType": "Text", "content": notification.body },
            "toRecipients": recipients,
        }
    })
}

#[async_trait::async_trait]
impl Notifier for GraphMailNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), SendError> {
        if notification.recipients.is_empty() {
            return Err(SendError::Config(
                "at least one recipient is required".to_string(),
            ));
        }

        let token = self
            .credentials
            .acquire_token()
            .await
            .map_err(|e| SendError::Auth(e.to_string()))?;

        let response = self
            .client
            .post(self.url.clone())
            .bearer_auth(token.secret())
            .json(&message_payload(notification))
            .send()
            .await?;
        let status = response.status();

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            tracing::warn!(
                sender = %self.sender,
                %status,
                body = %body,
                "sendMail returned non-2xx status"
            );
            return Err(SendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        tracing::info!(
            channel = "graph",
            sender = %self.sender,
            recipients = %notification.recipients.join(", "),
            "alert email sent"
        );
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "graph"
    }
}
