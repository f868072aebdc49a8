//! Cron-driven repetition of runs for `watch` mode.

use std::future::Future;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tracing::{info, warn};

use crate::orchestrator::{Orchestrator, RunReport};

#[derive(Debug, thiserror::Error)]
#[error("invalid cron expression '{expr}': {message}")]
pub struct ScheduleError {
    pub expr: String,
    pub message: String,
}

/// Normalize a 5-field cron expression to 6-field by prepending "0 " for seconds.
///
/// The `cron` crate requires `sec min hour day-of-month month day-of-week`.
pub fn normalize_cron(expr: &str) -> String {
    let trimmed = expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

pub fn parse_schedule(expr: &str) -> Result<Schedule, ScheduleError> {
    let normalized = normalize_cron(expr);
    Schedule::from_str(&normalized).map_err(|e| ScheduleError {
        expr: expr.to_string(),
        message: e.to_string(),
    })
}

/// First tick strictly after `after`.
pub fn next_tick(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Run `orchestrator` on every tick of `schedule` until `shutdown` resolves.
///
/// Runs are sequential. The next tick is computed after a run finishes, so
/// ticks that elapse during a run are skipped rather than queued.
pub async fn watch<F>(orchestrator: &Orchestrator, schedule: &Schedule, shutdown: F) -> usize
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut completed = 0usize;

    loop {
        let now = Utc::now();
        let Some(tick) = next_tick(schedule, now) else {
            warn!("cron schedule has no upcoming ticks, stopping");
            return completed;
        };
        let wait = (tick - now).to_std().unwrap_or_default();
        info!(next_run = %tick, "waiting for next scheduled run");

        tokio::select! {
            _ = &mut shutdown => {
                info!(runs = completed, "shutdown requested, leaving watch mode");
                return completed;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        let report = orchestrator.run().await;
        log_outcome(&report);
        completed += 1;
    }
}

fn log_outcome(report: &RunReport) {
    if report.is_aborted() {
        warn!(run_id = %report.run_id, "scheduled run aborted, next tick will retry");
    } else {
        info!(
            run_id = %report.run_id,
            matched = report.matched,
            soft_failures = report.soft_failures.len(),
            "scheduled run finished"
        );
    }
}
