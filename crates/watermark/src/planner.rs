//! Converts a possibly-untrustworthy stored watermark into a safe query start.
//!
//! Everything here is a pure function of its inputs, so the same
//! `(watermark, now, policy)` always maps to the same window boundary.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::warn;

use signwatch_core::config::{Granularity, WindowConfig};

use crate::model::{add_saturating, sub_saturating, Watermark};

/// Windowing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    /// Subtracted from the base instant so late-ingested events are still seen.
    pub overlap: Duration,
    /// How far in the future a stored watermark may be before it is discarded.
    pub skew_tolerance: Duration,
    /// Window used when no watermark is stored.
    pub lookback: Duration,
    /// Distance behind `now` a discarded future-dated watermark is reset to.
    pub skew_reset: Duration,
    pub granularity: Granularity,
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self::from(&WindowConfig::default())
    }
}

impl From<&WindowConfig> for WindowPolicy {
    fn from(config: &WindowConfig) -> Self {
        Self {
            overlap: config.overlap,
            skew_tolerance: config.skew_tolerance,
            lookback: config.lookback,
            skew_reset: config.skew_reset,
            granularity: config.granularity,
        }
    }
}

/// The lower bound for one event query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueryWindow {
    /// Inclusive lower bound sent to the event source.
    pub start: DateTime<Utc>,
    /// Instant the overlap was subtracted from.
    pub base: DateTime<Utc>,
    /// True when the stored watermark was future-dated and discarded.
    pub reset: bool,
}

impl QueryWindow {
    /// `start` in the form the query filter expects.
    pub fn start_rfc3339(&self) -> String {
        self.start.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

/// Compute the query start for a run.
///
/// A watermark more than `skew_tolerance` ahead of `now` is treated as
/// corrupt and replaced by `now - skew_reset`. One inside the tolerance but
/// still ahead of `now` is clamped to `now`. The overlap is then subtracted
/// and the result floored to the policy granularity, so `start <= now` and
/// `start <= watermark` always hold.
pub fn plan_window(watermark: Watermark, now: DateTime<Utc>, policy: &WindowPolicy) -> QueryWindow {
    let w = watermark.at();
    let horizon = add_saturating(now, policy.skew_tolerance);

    let (base, reset) = if w > horizon {
        let base = sub_saturating(now, policy.skew_reset);
        warn!(
            watermark = %watermark,
            now = %now,
            tolerance_secs = policy.skew_tolerance.as_secs(),
            substituted = %Watermark(base),
            "watermark is in the future, resetting"
        );
        (base, true)
    } else {
        (w.min(now), false)
    };

    let start = floor_to(sub_saturating(base, policy.overlap), policy.granularity);
    QueryWindow { start, base, reset }
}

/// Floor an instant to whole minutes or seconds.
pub fn floor_to(at: DateTime<Utc>, granularity: Granularity) -> DateTime<Utc> {
    let unit = match granularity {
        Granularity::Minute => 60,
        Granularity::Second => 1,
    };
    let secs = at.timestamp().div_euclid(unit) * unit;
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or(at)
}

/// The watermark a completed run should persist.
///
/// Normally the run's start time. If the previously stored watermark is later
/// than that but still plausible (the wall clock stepped back), it is kept so
/// the persisted value never decreases. A stored value beyond the skew
/// tolerance is never carried forward.
pub fn next_watermark(
    previous: Option<Watermark>,
    run_started_at: DateTime<Utc>,
    skew_tolerance: Duration,
) -> Watermark {
    let candidate = Watermark(run_started_at);
    match previous {
        Some(prev)
            if prev > candidate && prev.at() <= add_saturating(run_started_at, skew_tolerance) =>
        {
            warn!(
                previous = %prev,
                run_started_at = %candidate,
                "clock is behind the stored watermark, keeping stored value"
            );
            prev
        }
        _ => candidate,
    }
}
