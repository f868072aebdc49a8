//! OAuth2 client-credentials token provider.
//!
//! Requests app-only tokens from `{authority}/{tenant}/oauth2/v2.0/token`
//! and caches them until shortly before expiry, so the event query and the
//! mail notifier share one token per run.

use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Mutex;

use signwatch_core::config::GraphConfig;

use crate::error::AuthError;
use crate::traits::{AccessToken, CredentialProvider};

/// Tokens are refreshed this long before they expire.
const REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<i64>,
}

/// Acquires Graph tokens with a client id and secret.
pub struct ClientCredentialProvider {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
    cache: Mutex<Option<AccessToken>>,
}

impl std::fmt::Debug for ClientCredentialProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentialProvider")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl ClientCredentialProvider {
    /// Build a provider for one tenant.
    ///
    /// `scope` is usually `https://graph.microsoft.com/.default`. Every
    /// request is bounded by `timeout`.
    pub fn new(
        authority_host: &str,
        tenant_id: &str,
        client_id: String,
        client_secret: String,
        scope: String,
        timeout: Duration,
    ) -> Result<Self, AuthError> {
        if tenant_id.trim().is_empty() || client_id.trim().is_empty() {
            return Err(AuthError::Config(
                "tenant and client id must not be empty".to_string(),
            ));
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            token_url: format!(
                "{}/{}/oauth2/v2.0/token",
                authority_host.trim_end_matches('/'),
                tenant_id
            ),
            client_id,
            client_secret,
            scope,
            cache: Mutex::new(None),
        })
    }

    pub fn from_config(config: &GraphConfig) -> Result<Self, AuthError> {
        let missing = |key: &str| AuthError::Config(format!("{key} is not set"));
        let tenant_id = config.tenant_id.as_deref().ok_or_else(|| missing("TENANT_ID"))?;
        let client_id = config.client_id.clone().ok_or_else(|| missing("CLIENT_ID"))?;
        let client_secret = config
            .client_secret
            .clone()
            .ok_or_else(|| missing("CLIENT_SECRET"))?;

        Self::new(
            &config.authority_host,
            tenant_id,
            client_id,
            client_secret,
            format!("{}/.default", config.base_url.trim_end_matches('/')),
            config.timeout,
        )
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }

    async fn request_token(&self) -> Result<AccessToken, AuthError> {
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];

        let response = self.client.post(&self.token_url).form(&params).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(AuthError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TokenResponse = response.json().await?;
        let secret = parsed
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;
        // An out-of-range lifetime is treated as unknown.
        let expires_at = parsed
            .expires_in
            .and_then(chrono::Duration::try_seconds)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime));

        tracing::debug!(expires_at = ?expires_at, "access token acquired");
        Ok(AccessToken::new(secret, expires_at))
    }
}

#[async_trait::async_trait]
impl CredentialProvider for ClientCredentialProvider {
    async fn acquire_token(&self) -> Result<AccessToken, AuthError> {
        let mut cache = self.cache.lock().await;
        let margin = chrono::Duration::seconds(REFRESH_MARGIN_SECS);

        if let Some(token) = cache.as_ref() {
            if token.is_fresh(Utc::now(), margin) {
                return Ok(token.clone());
            }
        }

        let token = self.request_token().await?;
        // Without a known expiry the token is used once and never cached.
        *cache = token.expires_at().is_some().then(|| token.clone());
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_config() -> GraphConfig {
        GraphConfig {
            tenant_id: Some("contoso-tenant".to_string()),
            client_id: Some("app-id".to_string()),
            client_secret: Some("s3cret".to_string()),
            authority_host: "https://login.microsoftonline.com/".to_string(),
            base_url: "https://graph.microsoft.com".to_string(),
            max_pages: 50,
            timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn token_url_from_config() {
        let provider = ClientCredentialProvider::from_config(&graph_config()).unwrap();
        assert_eq!(
            provider.token_url(),
            "https://login.microsoftonline.com/contoso-tenant/oauth2/v2.0/token"
        );
        assert_eq!(provider.scope, "https://graph.microsoft.com/.default");
    }

    #[test]
    fn from_config_requires_secret() {
        let mut config = graph_config();
        config.client_secret = None;
        let err = ClientCredentialProvider::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("CLIENT_SECRET"), "got: {err}");
    }

    #[test]
    fn debug_hides_secret() {
        let provider = ClientCredentialProvider::from_config(&graph_config()).unwrap();
        assert!(!format!("{provider:?}").contains("s3cret"));
    }

    #[test]
    fn rejects_blank_tenant() {
        let result = ClientCredentialProvider::new(
            "https://login.microsoftonline.com",
            " ",
            "app".to_string(),
            "secret".to_string(),
            "scope".to_string(),
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(AuthError::Config(_))));
    }
}
