//! SMTP email notifier via `lettre` with TLS support.
//!
//! Alternative to the Graph mail channel for tenants that relay alerts
//! through their own SMTP server. Supports STARTTLS and implicit TLS.

use std::time::Duration;

use crate::traits::{Notification, Notifier, SendError};
use lettre::{
    message::Mailbox, transport::smtp::authentication::Credentials, AsyncSmtpTransport,
    AsyncTransport, Message, Tokio1Executor,
};
use signwatch_core::config::SmtpConfig;

/// Sends notifications as emails via SMTP.
#[derive(Debug)]
pub struct EmailNotifier {
    /// Async SMTP transport for sending emails.
    transport: AsyncSmtpTransport<Tokio1Executor>,
    /// Sender mailbox.
    from: Mailbox,
}

fn parse_mailbox(addr: &str) -> Result<Mailbox, SendError> {
    addr.trim()
        .parse()
        .map_err(|e: lettre::address::AddressError| SendError::Config(format!("{addr}: {e}")))
}

impl EmailNotifier {
    /// Build an `EmailNotifier` from SMTP configuration.
    ///
    /// Port 465 uses implicit TLS. Other ports use STARTTLS when `tls` is
    /// set and a plain connection otherwise. Credentials are attached only
    /// when both username and password are configured.
    pub fn from_config(
        smtp: &SmtpConfig,
        from: &str,
        timeout: Duration,
    ) -> Result<Self, SendError> {
        let host = smtp
            .host
            .as_deref()
            .ok_or_else(|| SendError::Config("SMTP_HOST is not set".to_string()))?;
        let from_mailbox = parse_mailbox(from)?;

        let mut builder = if smtp.port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .map_err(|e| SendError::Config(e.to_string()))?
                .port(smtp.port)
        } else if smtp.tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(|e| SendError::Config(e.to_string()))?
                .port(smtp.port)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host).port(smtp.port)
        };

        if let (Some(username), Some(password)) = (&smtp.username, &smtp.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            transport: builder.timeout(Some(timeout)).build(),
            from: from_mailbox,
        })
    }
}

#[async_trait::async_trait]
impl Notifier for EmailNotifier {
    /// Send a notification email to all of the notification's recipients.
    async fn send(&self, notification: &Notification) -> Result<(), SendError> {
        if notification.recipients.is_empty() {
            return Err(SendError::Config(
                "at least one recipient is required".to_string(),
            ));
        }

        let mut message_builder = Message::builder().from(self.from.clone());
        for recipient in &notification.recipients {
            message_builder = message_builder.to(parse_mailbox(recipient)?);
        }

        let email = message_builder
            .subject(&notification.subject)
            .body(notification.body.clone())
            .map_err(|e| SendError::Smtp(e.to_string()))?;

        self.transport
            .send(email)
            .await
            .map_err(|e| SendError::Smtp(e.to_string()))?;

        tracing::info!(
            channel = "email",
            subject = %notification.subject,
            recipients = notification.recipients.len(),
            "alert email sent"
        );

        Ok(())
    }

    /// Returns `"email"`.
    fn channel_name(&self) -> &str {
        "email"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smtp(port: u16, tls: bool) -> SmtpConfig {
        SmtpConfig {
            host: Some("smtp.example.com".to_string()),
            port,
            tls,
            username: None,
            password: None,
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[test]
    fn parse_email_with_display_name() {
        let mb = parse_mailbox("Alerts <alerts@example.com>").unwrap();
        assert_eq!(mb.email.to_string(), "alerts@example.com");
    }

    #[test]
    fn from_config_valid() {
        assert!(EmailNotifier::from_config(&smtp(587, true), "alerts@example.com", TIMEOUT).is_ok());
    }

    #[test]
    fn from_config_implicit_tls_port() {
        assert!(EmailNotifier::from_config(&smtp(465, true), "alerts@example.com", TIMEOUT).is_ok());
    }

    #[test]
    fn from_config_no_tls_with_credentials() {
        let mut config = smtp(25, false);
        config.username = Some("relay".to_string());
        config.password = Some("pw".to_string());
        assert!(EmailNotifier::from_config(&config, "alerts@example.com", TIMEOUT).is_ok());
    }

    #[test]
    fn from_config_invalid_from_address() {
        let err = EmailNotifier::from_config(&smtp(587, true), "bad-address", TIMEOUT).unwrap_err();
        assert!(err.to_string().contains("Configuration error"), "got: {err}");
    }

    #[test]
    fn from_config_requires_host() {
        let mut config = smtp(587, true);
        config.host = None;
        let err = EmailNotifier::from_config(&config, "alerts@example.com", TIMEOUT).unwrap_err();
        assert!(err.to_string().contains("SMTP_HOST"), "got: {err}");
    }

    #[tokio::test]
    async fn send_rejects_invalid_recipient_before_connecting() {
        let notifier =
            EmailNotifier::from_config(&smtp(587, true), "alerts@example.com", TIMEOUT).unwrap();
        let result = notifier
            .send(&Notification {
                recipients: vec!["not-valid".to_string()],
                subject: "s".to_string(),
                body: "b".to_string(),
            })
            .await;
        assert!(matches!(result, Err(SendError::Config(_))));
    }

    #[tokio::test]
    async fn send_requires_recipients() {
        let notifier =
            EmailNotifier::from_config(&smtp(587, true), "alerts@example.com", TIMEOUT).unwrap();
        let result = notifier
            .send(&Notification {
                recipients: vec![],
                subject: "s".to_string(),
                body: "b".to_string(),
            })
            .await;
        assert!(matches!(result, Err(SendError::Config(_))));
    }

    #[test]
    fn channel_name_is_email() {
        let notifier =
            EmailNotifier::from_config(&smtp(587, true), "alerts@example.com", TIMEOUT).unwrap();
        assert_eq!(notifier.channel_name(), "email");
    }
}
