use std::fmt;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Instant up to which sign-in events have been considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(pub DateTime<Utc>);

impl Watermark {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(at)
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.0
    }

    /// `now - lookback`, saturating at the earliest representable instant.
    pub fn lookback_from(now: DateTime<Utc>, lookback: Duration) -> Self {
        Self(sub_saturating(now, lookback))
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }
}

impl From<DateTime<Utc>> for Watermark {
    fn from(at: DateTime<Utc>) -> Self {
        Self(at)
    }
}

/// Where a loaded watermark came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatermarkOrigin {
    Stored,
    /// No usable value was persisted; `now - lookback` was substituted.
    Defaulted { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedWatermark {
    pub value: Watermark,
    pub origin: WatermarkOrigin,
}

impl LoadedWatermark {
    pub fn stored(&self) -> Option<Watermark> {
        match self.origin {
            WatermarkOrigin::Stored => Some(self.value),
            WatermarkOrigin::Defaulted { .. } => None,
        }
    }
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

pub(crate) fn sub_saturating(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    at.checked_sub_signed(to_chrono(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn add_saturating(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    at.checked_add_signed(to_chrono(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
