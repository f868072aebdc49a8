use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rendered in place of any optional field the audit log left empty.
pub const PLACEHOLDER: &str = "N/A";

/// A single sign-in record from the audit log.
///
/// Every field is optional on the wire: the audit source omits or nulls
/// fields freely, and a sparse record must never fail the whole batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub user_principal_name: Option<String>,
    #[serde(default)]
    pub user_display_name: Option<String>,
    #[serde(default)]
    pub created_date_time: Option<String>,
    #[serde(default)]
    pub is_interactive: Option<bool>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub app_display_name: Option<String>,
    #[serde(default)]
    pub client_app_used: Option<String>,
    #[serde(default)]
    pub location: Option<SignInLocation>,
    #[serde(default)]
    pub status: Option<SignInStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInLocation {
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub country_or_region: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInStatus {
    #[serde(default)]
    pub error_code: Option<i64>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|s| !s.trim().is_empty())
}

impl SignInEvent {
    /// Subject identity, or the placeholder when absent.
    pub fn subject(&self) -> &str {
        non_empty(self.user_principal_name.as_ref()).unwrap_or(PLACEHOLDER)
    }

    pub fn display_name(&self) -> &str {
        non_empty(self.user_display_name.as_ref()).unwrap_or(PLACEHOLDER)
    }

    pub fn city(&self) -> &str {
        non_empty(self.location.as_ref().and_then(|l| l.city.as_ref())).unwrap_or(PLACEHOLDER)
    }

    pub fn region(&self) -> Option<&str> {
        non_empty(self.location.as_ref().and_then(|l| l.country_or_region.as_ref()))
    }

    pub fn error_code(&self) -> Option<i64> {
        self.status.as_ref().and_then(|s| s.error_code)
    }

    /// Raw creation timestamp as reported by the source.
    pub fn created(&self) -> &str {
        non_empty(self.created_date_time.as_ref()).unwrap_or(PLACEHOLDER)
    }

    /// Parsed creation timestamp, if the source sent a valid RFC 3339 value.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_date_time
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}
