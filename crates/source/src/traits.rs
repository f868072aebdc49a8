//! Collaborator traits for credentials and sign-in events.

use std::fmt;

use chrono::{DateTime, Utc};

use signwatch_core::SignInEvent;

use crate::error::{AuthError, FetchError};

/// Opaque bearer credential.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    secret: String,
    expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(secret: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            secret: secret.into(),
            expires_at,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Whether the token is still good at `now` with `margin` to spare.
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        match self.expires_at {
            Some(exp) => now + margin < exp,
            None => true,
        }
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Supplies bearer tokens for the audit and mail APIs.
#[async_trait::async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn acquire_token(&self) -> Result<AccessToken, AuthError>;
}

/// Queries the sign-in audit log.
#[async_trait::async_trait]
pub trait EventSource: Send + Sync {
    /// Fetch every suspicious sign-in created at or after `start`.
    async fn fetch_events(
        &self,
        token: &AccessToken,
        start: DateTime<Utc>,
    ) -> Result<Vec<SignInEvent>, FetchError>;
}
