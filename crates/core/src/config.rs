use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::{format_duration, parse_duration};
use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key).map(|v| v.to_ascii_lowercase()) {
        Some(v) if v == "true" || v == "1" || v == "yes" => true,
        Some(v) if v == "false" || v == "0" || v == "no" => false,
        _ => default,
    }
}

fn profiled_env_duration(profile: &str, key: &str, default: Duration) -> Duration {
    match profiled_env_opt(profile, key) {
        Some(raw) => parse_duration(&raw).unwrap_or_else(|| {
            tracing::warn!(
                key,
                value = %raw,
                default = %format_duration(default),
                "unparseable duration, using default"
            );
            default
        }),
        None => default,
    }
}

/// Split a delimited address list (`;` or `,`), dropping blanks.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split([';', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub graph: GraphConfig,
    pub alert: AlertConfig,
    pub smtp: SmtpConfig,
    pub window: WindowConfig,
    pub state: StateConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `SIGNWATCH_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("SIGNWATCH_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        let graph = GraphConfig::from_env_profiled(p);
        let state = StateConfig::from_env_profiled(p, default_lease_ttl(&graph));
        Self {
            profile: p.to_string(),
            graph,
            alert: AlertConfig::from_env_profiled(p),
            smtp: SmtpConfig::from_env_profiled(p),
            window: WindowConfig::from_env_profiled(p),
            state,
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Check that everything a live run needs is present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.graph.tenant_id.is_none() {
            return Err(ConfigError::Missing("TENANT_ID"));
        }
        if self.graph.client_id.is_none() {
            return Err(ConfigError::Missing("CLIENT_ID"));
        }
        if self.graph.client_secret.is_none() {
            return Err(ConfigError::Missing("CLIENT_SECRET"));
        }
        if self.alert.recipients.is_empty() {
            return Err(ConfigError::Missing("ALERT_EMAILS"));
        }
        if self.alert.sender.is_none() {
            return Err(ConfigError::Missing("SENDER_EMAIL"));
        }
        if self.alert.channel == NotifyChannel::Smtp && self.smtp.host.is_none() {
            return Err(ConfigError::Missing("SMTP_HOST"));
        }
        let longest_run = self.graph.max_run_duration();
        if self.state.lease_ttl < longest_run {
            return Err(ConfigError::Invalid {
                key: "LEASE_TTL",
                message: format!(
                    "{} is shorter than the longest possible run ({}); \
                     raise LEASE_TTL or lower HTTP_TIMEOUT / GRAPH_MAX_PAGES",
                    format_duration(self.state.lease_ttl),
                    format_duration(longest_run),
                ),
            });
        }
        if self.alert.allowed_region.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "ALLOWED_REGION",
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  graph:   tenant={}, client={}, secret={}, base={}",
            self.graph.tenant_id.as_deref().unwrap_or("(none)"),
            self.graph.client_id.as_deref().unwrap_or("(none)"),
            if self.graph.client_secret.is_some() { "set" } else { "(none)" },
            self.graph.base_url,
        );
        tracing::info!(
            "  alert:   region={}, channel={}, sender={}, recipients={}",
            self.alert.allowed_region,
            self.alert.channel,
            self.alert.sender.as_deref().unwrap_or("(none)"),
            self.alert.recipients.len(),
        );
        tracing::info!(
            "  window:  lookback={}, overlap={}, skew_tolerance={}, skew_reset={}, granularity={}",
            format_duration(self.window.lookback),
            format_duration(self.window.overlap),
            format_duration(self.window.skew_tolerance),
            format_duration(self.window.skew_reset),
            self.window.granularity,
        );
        tracing::info!(
            "  state:   path={}, lease_ttl={}",
            self.state.path.display(),
            format_duration(self.state.lease_ttl),
        );
    }
}

// ── Graph / credentials ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub authority_host: String,
    pub base_url: String,
    pub max_pages: u32,
    pub timeout: Duration,
}

impl GraphConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            tenant_id: profiled_env_opt(p, "TENANT_ID"),
            client_id: profiled_env_opt(p, "CLIENT_ID"),
            client_secret: profiled_env_opt(p, "CLIENT_SECRET"),
            authority_host: profiled_env_or(p, "AUTHORITY_HOST", "https://login.microsoftonline.com"),
            base_url: profiled_env_or(p, "GRAPH_BASE_URL", "https://graph.microsoft.com"),
            max_pages: profiled_env_u32(p, "GRAPH_MAX_PAGES", 50),
            timeout: profiled_env_duration(p, "HTTP_TIMEOUT", Duration::from_secs(30)),
        }
    }

    /// Bound on one token request or alert delivery. Slightly above the HTTP
    /// client timeout so the client's own error is the one reported.
    pub fn call_timeout(&self) -> Duration {
        self.timeout.saturating_add(CALL_TIMEOUT_HEADROOM)
    }

    /// Bound on a full paginated sign-in query.
    pub fn fetch_timeout(&self) -> Duration {
        self.call_timeout().saturating_mul(self.max_pages.max(1))
    }

    /// Upper bound on one run: token, fetch, and delivery, plus slack for
    /// local work.
    pub fn max_run_duration(&self) -> Duration {
        self.call_timeout()
            .saturating_mul(2)
            .saturating_add(self.fetch_timeout())
            .saturating_add(RUN_SLACK)
    }
}

const CALL_TIMEOUT_HEADROOM: Duration = Duration::from_secs(5);
const RUN_SLACK: Duration = Duration::from_secs(60);
const MIN_LEASE_TTL: Duration = Duration::from_secs(15 * 60);

/// A lease that outlives the longest possible run, and never under 15m.
fn default_lease_ttl(graph: &GraphConfig) -> Duration {
    graph.max_run_duration().max(MIN_LEASE_TTL)
}

// ── Alerting ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyChannel {
    Graph,
    Smtp,
}

impl FromStr for NotifyChannel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "graph" => Ok(Self::Graph),
            "smtp" => Ok(Self::Smtp),
            other => Err(ConfigError::Invalid {
                key: "NOTIFY_CHANNEL",
                message: format!("expected 'graph' or 'smtp', got '{other}'"),
            }),
        }
    }
}

impl fmt::Display for NotifyChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graph => f.write_str("graph"),
            Self::Smtp => f.write_str("smtp"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Region code sign-ins are expected from (e.g. "PT").
    pub allowed_region: String,
    pub recipients: Vec<String>,
    pub sender: Option<String>,
    pub channel: NotifyChannel,
    pub subject_template: Option<String>,
    pub body_template: Option<String>,
}

impl AlertConfig {
    fn from_env_profiled(p: &str) -> Self {
        let channel = profiled_env_or(p, "NOTIFY_CHANNEL", "graph");
        Self {
            allowed_region: profiled_env_or(p, "ALLOWED_REGION", "PT"),
            recipients: profiled_env_opt(p, "ALERT_EMAILS")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            sender: profiled_env_opt(p, "SENDER_EMAIL"),
            channel: channel.parse().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "falling back to graph notifier");
                NotifyChannel::Graph
            }),
            subject_template: profiled_env_opt(p, "ALERT_SUBJECT_TEMPLATE"),
            body_template: profiled_env_opt(p, "ALERT_BODY_TEMPLATE"),
        }
    }
}

// ── SMTP ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: u16,
    pub tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl SmtpConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_opt(p, "SMTP_HOST"),
            port: profiled_env_u16(p, "SMTP_PORT", 587),
            tls: profiled_env_bool(p, "SMTP_TLS", true),
            username: profiled_env_opt(p, "SMTP_USERNAME"),
            password: profiled_env_opt(p, "SMTP_PASSWORD"),
        }
    }
}

// ── Window ────────────────────────────────────────────────────

/// Precision the query start-time is floored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Minute,
    Second,
}

impl FromStr for Granularity {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minute" | "minutes" | "m" => Ok(Self::Minute),
            "second" | "seconds" | "s" => Ok(Self::Second),
            other => Err(ConfigError::Invalid {
                key: "WINDOW_GRANULARITY",
                message: format!("expected 'minute' or 'second', got '{other}'"),
            }),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Minute => f.write_str("minute"),
            Self::Second => f.write_str("second"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    pub lookback: Duration,
    pub overlap: Duration,
    pub skew_tolerance: Duration,
    /// How far back a discarded future-dated watermark is reset to.
    pub skew_reset: Duration,
    pub granularity: Granularity,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            lookback: Duration::from_secs(3_600),
            overlap: Duration::from_secs(60),
            skew_tolerance: Duration::from_secs(120),
            skew_reset: Duration::from_secs(3_600),
            granularity: Granularity::Minute,
        }
    }
}

impl WindowConfig {
    fn from_env_profiled(p: &str) -> Self {
        let defaults = Self::default();
        Self {
            lookback: profiled_env_duration(p, "LOOKBACK", defaults.lookback),
            overlap: profiled_env_duration(p, "OVERLAP", defaults.overlap),
            skew_tolerance: profiled_env_duration(p, "SKEW_TOLERANCE", defaults.skew_tolerance),
            skew_reset: profiled_env_duration(p, "SKEW_RESET", defaults.skew_reset),
            granularity: profiled_env_opt(p, "WINDOW_GRANULARITY")
                .map(|raw| {
                    raw.parse().unwrap_or_else(|e| {
                        tracing::warn!(error = %e, "using minute granularity");
                        Granularity::Minute
                    })
                })
                .unwrap_or(defaults.granularity),
        }
    }
}

// ── Persisted state ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    pub path: PathBuf,
    pub lease_ttl: Duration,
}

impl StateConfig {
    fn from_env_profiled(p: &str, default_lease_ttl: Duration) -> Self {
        Self {
            path: PathBuf::from(profiled_env_or(p, "STATE_PATH", "data/last_run.json")),
            lease_ttl: profiled_env_duration(p, "LEASE_TTL", default_lease_ttl),
        }
    }
}
