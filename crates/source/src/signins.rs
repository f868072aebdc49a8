//! Graph `auditLogs/signIns` event source.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use url::Url;

use signwatch_core::{Config, SignInEvent};

use crate::error::FetchError;
use crate::traits::{AccessToken, EventSource};

const SIGNINS_PATH: &str = "beta/auditLogs/signIns";

/// OData filter selecting successful interactive sign-ins from outside
/// `allowed_region` created at or after `start`.
pub fn sign_in_filter(start: DateTime<Utc>, allowed_region: &str) -> String {
    // OData string literals escape a quote by doubling it.
    let region = allowed_region.trim().replace('\'', "''");
    [
        format!(
            "createdDateTime ge {}",
            start.to_rfc3339_opts(SecondsFormat::Secs, true)
        ),
        format!("location/countryOrRegion ne '{region}'"),
        "isInteractive eq true".to_string(),
        "status/errorCode eq 0".to_string(),
    ]
    .join(" and ")
}

/// One page of a Graph collection response.
#[derive(Debug, Deserialize)]
struct SignInPage {
    #[serde(default)]
    value: Vec<SignInEvent>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

/// Reads suspicious sign-ins from Microsoft Graph, following pagination.
#[derive(Debug)]
pub struct GraphSignInSource {
    client: reqwest::Client,
    signins_url: Url,
    allowed_region: String,
    max_pages: u32,
}

impl GraphSignInSource {
    pub fn new(
        base_url: &str,
        allowed_region: impl Into<String>,
        max_pages: u32,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let base = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))
            .map_err(|e| FetchError::Config(format!("invalid Graph base URL '{base_url}': {e}")))?;
        let signins_url = base
            .join(SIGNINS_PATH)
            .map_err(|e| FetchError::Config(e.to_string()))?;

        if max_pages == 0 {
            return Err(FetchError::Config("max_pages must be at least 1".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            signins_url,
            allowed_region: allowed_region.into(),
            max_pages,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, FetchError> {
        Self::new(
            &config.graph.base_url,
            config.alert.allowed_region.clone(),
            config.graph.max_pages,
            config.graph.timeout,
        )
    }

    /// First-page URL for a query starting at `start`.
    pub fn query_url(&self, start: DateTime<Utc>) -> Url {
        let mut url = self.signins_url.clone();
        url.query_pairs_mut()
            .append_pair("$filter", &sign_in_filter(start, &self.allowed_region));
        url
    }

    /// Parse a `@odata.nextLink`, refusing any origin other than the query's,
    /// since the bearer token is sent along with it.
    fn next_page_url(&self, link: &str) -> Result<Url, FetchError> {
        let url = Url::parse(link)
            .map_err(|e| FetchError::Decode(format!("invalid @odata.nextLink '{link}': {e}")))?;
        if url.origin() != self.signins_url.origin() {
            return Err(FetchError::Decode(format!(
                "@odata.nextLink points to a different origin: {}",
                url.origin().ascii_serialization()
            )));
        }
        Ok(url)
    }

    async fn fetch_page(&self, token: &AccessToken, url: Url) -> Result<SignInPage, FetchError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(token.secret())
            .send()
            .await?;
        let status = response.status();

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

#[async_trait::async_trait]
impl EventSource for GraphSignInSource {
    async fn fetch_events(
        &self,
        token: &AccessToken,
        start: DateTime<Utc>,
    ) -> Result<Vec<SignInEvent>, FetchError> {
        let mut next = Some(self.query_url(start));
        let mut events = Vec::new();
        let mut pages = 0u32;

        while let Some(url) = next.take() {
            if pages == self.max_pages {
                // Returning a partial batch would let the watermark skip the rest.
                return Err(FetchError::TooManyPages(self.max_pages));
            }
            let page = self.fetch_page(token, url).await?;
            pages += 1;
            tracing::debug!(page = pages, count = page.value.len(), "fetched sign-in page");
            events.extend(page.value);
            next = match page.next_link.filter(|link| !link.is_empty()) {
                Some(link) => Some(self.next_page_url(&link)?),
                None => None,
            };
        }

        tracing::info!(
            start = %start.to_rfc3339_opts(SecondsFormat::Secs, true),
            pages,
            count = events.len(),
            "sign-in query complete"
        );
        Ok(events)
    }
}
