//! One alerting run, from lease to persisted watermark.
//!
//! Stages advance linearly:
//! `Start → TokenAcquired → WindowPlanned → EventsFetched → Evaluated →
//! Notified → WatermarkPersisted → Done`. Credential and fetch failures (and a
//! held lease) abort the run with the watermark untouched. Notification and
//! persistence failures are recorded as soft failures and the run completes.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use signwatch_notify::{Notification, Notifier, SendError};
use signwatch_source::{AuthError, CredentialProvider, EventSource, FetchError};
use signwatch_watermark::{
    next_watermark, plan_window, QueryWindow, StoreError, Watermark, WatermarkStore,
    WindowPolicy,
};

use crate::evaluator::{evaluate, AlertFormat};

/// Furthest stage a run reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Start,
    TokenAcquired,
    WindowPlanned,
    EventsFetched,
    Evaluated,
    Notified,
    WatermarkPersisted,
    Done,
    Aborted,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::TokenAcquired => "token_acquired",
            Self::WindowPlanned => "window_planned",
            Self::EventsFetched => "events_fetched",
            Self::Evaluated => "evaluated",
            Self::Notified => "notified",
            Self::WatermarkPersisted => "watermark_persisted",
            Self::Done => "done",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// A failure observed during a run, tagged by collaborator.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("credential acquisition failed: {0}")]
    Auth(#[from] AuthError),

    #[error("event fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("notification failed: {0}")]
    Send(#[from] SendError),

    #[error("watermark store failed: {0}")]
    Store(#[from] StoreError),
}

/// Knobs for the orchestrator that do not come from a collaborator.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub policy: WindowPolicy,
    /// Bound on token acquisition and alert delivery.
    pub call_timeout: Duration,
    /// Bound on the whole paginated event fetch.
    pub fetch_timeout: Duration,
    pub lease_ttl: Duration,
    /// Fetch and render, but neither send nor persist.
    pub dry_run: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            policy: WindowPolicy::default(),
            call_timeout: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(120),
            lease_ttl: Duration::from_secs(15 * 60),
            dry_run: false,
        }
    }
}

/// Outcome of a single run.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub stage: RunStage,
    pub window: Option<QueryWindow>,
    /// Events that matched the alert predicate.
    pub matched: usize,
    pub notified: bool,
    /// Watermark written at the end of the run, if any.
    pub persisted: Option<Watermark>,
    /// Rendered alert that a dry run would have sent.
    pub preview: Option<Notification>,
    pub soft_failures: Vec<RunError>,
    /// The failure that stopped the run early.
    pub abort: Option<RunError>,
}

impl RunReport {
    fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            stage: RunStage::Start,
            window: None,
            matched: 0,
            notified: false,
            persisted: None,
            preview: None,
            soft_failures: Vec::new(),
            abort: None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.stage == RunStage::Aborted
    }

    fn aborted(mut self, err: RunError) -> Self {
        error!(stage = %self.stage, error = %err, "run aborted, watermark not advanced");
        self.stage = RunStage::Aborted;
        self.abort = Some(err);
        self
    }
}

/// Run `fut` under `limit`, mapping expiry through `on_timeout`.
async fn bounded<T, E>(
    limit: Duration,
    fut: impl Future<Output = Result<T, E>>,
    on_timeout: impl FnOnce(u64) -> E,
) -> Result<T, E> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout(limit.as_millis() as u64)),
    }
}

/// Sequences one alerting run against its collaborators.
pub struct Orchestrator {
    credentials: Arc<dyn CredentialProvider>,
    source: Arc<dyn EventSource>,
    notifier: Arc<dyn Notifier>,
    store: Arc<dyn WatermarkStore>,
    format: AlertFormat,
    settings: RunSettings,
}

impl Orchestrator {
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        source: Arc<dyn EventSource>,
        notifier: Arc<dyn Notifier>,
        store: Arc<dyn WatermarkStore>,
        format: AlertFormat,
        settings: RunSettings,
    ) -> Self {
        Self {
            credentials,
            source,
            notifier,
            store,
            format,
            settings,
        }
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Execute one run starting now.
    pub async fn run(&self) -> RunReport {
        self.run_at(Utc::now()).await
    }

    /// Execute one run whose start time is `started_at`.
    ///
    /// `started_at` is both the planner's "now" and the watermark persisted
    /// on completion, so events created while the run is in flight fall in
    /// the next window.
    pub async fn run_at(&self, started_at: DateTime<Utc>) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, dry_run = self.settings.dry_run);
        self.execute(RunReport::new(run_id, started_at))
            .instrument(span)
            .await
    }

    async fn execute(&self, mut report: RunReport) -> RunReport {
        let started_at = report.started_at;
        let settings = &self.settings;
        info!(started_at = %Watermark(started_at), "run started");

        // Held until the end of this function; dropping it releases the lock.
        let _lease = if settings.dry_run {
            None
        } else {
            match self.store.acquire_lease(settings.lease_ttl, started_at) {
                Ok(lease) => lease,
                Err(e) => return report.aborted(e.into()),
            }
        };

        let token = match bounded(
            settings.call_timeout,
            self.credentials.acquire_token(),
            AuthError::Timeout,
        )
        .await
        {
            Ok(token) => token,
            Err(e) => return report.aborted(e.into()),
        };
        report.stage = RunStage::TokenAcquired;

        let loaded = self.store.load(started_at, settings.policy.lookback);
        let window = plan_window(loaded.value, started_at, &settings.policy);
        report.window = Some(window);
        report.stage = RunStage::WindowPlanned;
        info!(
            watermark = %loaded.value,
            start = %window.start_rfc3339(),
            reset = window.reset,
            "query window planned"
        );

        let events = match bounded(
            settings.fetch_timeout,
            self.source.fetch_events(&token, window.start),
            FetchError::Timeout,
        )
        .await
        {
            Ok(events) => events,
            Err(e) => return report.aborted(e.into()),
        };
        report.stage = RunStage::EventsFetched;
        info!(count = events.len(), "sign-in events fetched");

        let decision = evaluate(events);
        report.matched = decision.len();
        report.stage = RunStage::Evaluated;

        match decision.notification(&self.format, started_at) {
            Ok(Some(notification)) if settings.dry_run => {
                info!(
                    subject = %notification.subject,
                    recipients = notification.recipients.len(),
                    "dry run, alert not sent"
                );
                report.preview = Some(notification);
            }
            Ok(Some(notification)) => {
                let sent = bounded(
                    settings.call_timeout,
                    self.notifier.send(&notification),
                    SendError::Timeout,
                )
                .await;
                match sent {
                    Ok(()) => {
                        report.notified = true;
                        report.stage = RunStage::Notified;
                    }
                    Err(e) => {
                        warn!(
                            channel = self.notifier.channel_name(),
                            error = %e,
                            "alert delivery failed, advancing watermark anyway"
                        );
                        report.soft_failures.push(e.into());
                    }
                }
            }
            Ok(None) => info!("no suspicious sign-ins, nothing to send"),
            Err(e) => {
                warn!(error = %e, "alert rendering failed, advancing watermark anyway");
                report.soft_failures.push(e.into());
            }
        }

        if settings.dry_run {
            report.stage = RunStage::Done;
            info!(matched = report.matched, "dry run complete, watermark not persisted");
            return report;
        }

        let next = next_watermark(loaded.stored(), started_at, settings.policy.skew_tolerance);
        match self.store.save(next) {
            Ok(()) => {
                report.persisted = Some(next);
                report.stage = RunStage::WatermarkPersisted;
            }
            Err(e) => {
                error!(watermark = %next, error = %e, "failed to persist watermark");
                report.soft_failures.push(e.into());
            }
        }

        report.stage = RunStage::Done;
        info!(
            matched = report.matched,
            notified = report.notified,
            soft_failures = report.soft_failures.len(),
            "run complete"
        );
        report
    }
}
