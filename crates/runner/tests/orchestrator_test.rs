//! End-to-end runs against mock collaborators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use signwatch_core::{SignInEvent, SignInLocation};
use signwatch_notify::{AlertTemplates, Notification, Notifier, SendError};
use signwatch_runner::{AlertFormat, Orchestrator, RunError, RunSettings, RunStage};
use signwatch_source::{AccessToken, AuthError, CredentialProvider, EventSource, FetchError};
use signwatch_watermark::{
    FileWatermarkStore, MemoryWatermarkStore, RunLease, StoreError, Watermark, WatermarkStore,
};

fn ts(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

// ── mocks ───────────────────────────────────────────────────────────

#[derive(Default)]
struct MockCredentials {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait::async_trait]
impl CredentialProvider for MockCredentials {
    async fn acquire_token(&self) -> Result<AccessToken, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AuthError::Status {
                status: 401,
                body: "invalid_client".to_string(),
            });
        }
        Ok(AccessToken::new("token", None))
    }
}

enum SourceBehavior {
    Events(Vec<SignInEvent>),
    Fail,
    Hang,
}

struct MockSource {
    behavior: SourceBehavior,
    starts: Mutex<Vec<DateTime<Utc>>>,
}

impl MockSource {
    fn new(behavior: SourceBehavior) -> Self {
        Self {
            behavior,
            starts: Mutex::new(Vec::new()),
        }
    }

    fn starts(&self) -> Vec<DateTime<Utc>> {
        self.starts.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl EventSource for MockSource {
    async fn fetch_events(
        &self,
        token: &AccessToken,
        start: DateTime<Utc>,
    ) -> Result<Vec<SignInEvent>, FetchError> {
        assert_eq!(token.secret(), "token");
        self.starts.lock().unwrap().push(start);
        match &self.behavior {
            SourceBehavior::Events(events) => Ok(events.clone()),
            SourceBehavior::Fail => Err(FetchError::Status {
                status: 503,
                body: "unavailable".to_string(),
            }),
            SourceBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(vec![])
            }
        }
    }
}

#[derive(Default)]
struct MockNotifier {
    sent: Mutex<Vec<Notification>>,
    attempts: AtomicUsize,
    fail: bool,
}

impl MockNotifier {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl Notifier for MockNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), SendError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(SendError::Status {
                status: 500,
                body: "mailbox unavailable".to_string(),
            });
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "mock"
    }
}

/// Reads fine, refuses every write.
struct ReadOnlyStore {
    value: Watermark,
}

impl WatermarkStore for ReadOnlyStore {
    fn read(&self) -> Result<Option<Watermark>, StoreError> {
        Ok(Some(self.value))
    }

    fn save(&self, _watermark: Watermark) -> Result<(), StoreError> {
        Err(StoreError::Corrupt {
            path: "/readonly/last_run.json".into(),
            message: "read-only filesystem".to_string(),
        })
    }
}

// ── harness ─────────────────────────────────────────────────────────

struct Harness {
    credentials: Arc<MockCredentials>,
    source: Arc<MockSource>,
    notifier: Arc<MockNotifier>,
    store: Arc<dyn WatermarkStore>,
    settings: RunSettings,
}

impl Harness {
    fn new(behavior: SourceBehavior, store: Arc<dyn WatermarkStore>) -> Self {
        Self {
            credentials: Arc::new(MockCredentials::default()),
            source: Arc::new(MockSource::new(behavior)),
            notifier: Arc::new(MockNotifier::default()),
            store,
            settings: RunSettings::default(),
        }
    }

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.credentials.clone(),
            self.source.clone(),
            self.notifier.clone(),
            self.store.clone(),
            AlertFormat::new(
                "PT",
                vec!["ops@contoso.com".to_string(), "sec@contoso.com".to_string()],
                AlertTemplates::default(),
            ),
            self.settings.clone(),
        )
    }
}

fn suspicious(upn: &str, city: &str) -> SignInEvent {
    SignInEvent {
        user_principal_name: Some(upn.to_string()),
        created_date_time: Some("2024-01-01T10:30:00Z".to_string()),
        location: Some(SignInLocation {
            city: Some(city.to_string()),
            country_or_region: Some("ES".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn memory_store(at: &str) -> Arc<MemoryWatermarkStore> {
    Arc::new(MemoryWatermarkStore::with_value(Watermark(ts(at))))
}

// ── tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn matches_are_sent_and_watermark_advances_to_run_start() {
    let store = memory_store("2024-01-01T10:00:00Z");
    let h = Harness::new(
        SourceBehavior::Events(vec![
            suspicious("alice@contoso.com", "Madrid"),
            suspicious("bob@contoso.com", "Vigo"),
        ]),
        store.clone(),
    );

    let report = h.orchestrator().run_at(ts("2024-01-01T11:00:00Z")).await;

    assert_eq!(report.stage, RunStage::Done);
    assert!(report.abort.is_none());
    assert!(report.soft_failures.is_empty());
    assert_eq!(report.matched, 2);
    assert!(report.notified);
    assert_eq!(h.source.starts(), vec![ts("2024-01-01T09:59:00Z")]);
    assert_eq!(report.window.unwrap().start, ts("2024-01-01T09:59:00Z"));

    let sent = h.notifier.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipients, vec!["ops@contoso.com", "sec@contoso.com"]);
    assert_eq!(sent[0].subject, "[Alert] 2 suspicious sign-ins detected");
    assert!(sent[0].body.contains("Location: Madrid"));

    assert_eq!(store.get(), Some(Watermark(ts("2024-01-01T11:00:00Z"))));
    assert_eq!(report.persisted, Some(Watermark(ts("2024-01-01T11:00:00Z"))));
}

#[tokio::test]
async fn empty_batch_never_sends_but_still_persists() {
    let store = memory_store("2024-01-01T10:00:00Z");
    let h = Harness::new(SourceBehavior::Events(vec![]), store.clone());

    let report = h.orchestrator().run_at(ts("2024-01-01T11:00:00Z")).await;

    assert_eq!(report.stage, RunStage::Done);
    assert_eq!(report.matched, 0);
    assert!(!report.notified);
    assert_eq!(h.notifier.attempts.load(Ordering::SeqCst), 0);
    assert_eq!(store.save_count(), 1);
    assert_eq!(store.get(), Some(Watermark(ts("2024-01-01T11:00:00Z"))));
}

#[tokio::test]
async fn failed_send_is_soft_and_watermark_still_advances() {
    let store = memory_store("2024-01-01T10:00:00Z");
    let mut h = Harness::new(
        SourceBehavior::Events(vec![suspicious("alice@contoso.com", "Madrid")]),
        store.clone(),
    );
    h.notifier = Arc::new(MockNotifier::failing());

    let report = h.orchestrator().run_at(ts("2024-01-01T11:00:00Z")).await;

    assert_eq!(report.stage, RunStage::Done);
    assert!(!report.notified);
    assert!(report.abort.is_none());
    assert_eq!(report.soft_failures.len(), 1);
    assert!(matches!(
        report.soft_failures[0],
        RunError::Send(SendError::Status { status: 500, .. })
    ));
    assert_eq!(h.notifier.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(store.get(), Some(Watermark(ts("2024-01-01T11:00:00Z"))));
}

#[tokio::test]
async fn failed_fetch_aborts_without_saving_and_next_run_repeats_window() {
    let store = memory_store("2024-01-01T10:00:00Z");
    let h = Harness::new(SourceBehavior::Fail, store.clone());
    let orchestrator = h.orchestrator();

    let first = orchestrator.run_at(ts("2024-01-01T11:00:00Z")).await;
    assert_eq!(first.stage, RunStage::Aborted);
    assert!(first.is_aborted());
    assert!(matches!(
        first.abort,
        Some(RunError::Fetch(FetchError::Status { status: 503, .. }))
    ));
    assert_eq!(store.save_count(), 0);
    assert_eq!(h.notifier.attempts.load(Ordering::SeqCst), 0);

    let second = orchestrator.run_at(ts("2024-01-01T11:15:00Z")).await;
    assert!(second.is_aborted());
    assert_eq!(store.save_count(), 0);
    assert_eq!(store.get(), Some(Watermark(ts("2024-01-01T10:00:00Z"))));

    let starts = h.source.starts();
    assert_eq!(starts.len(), 2);
    assert_eq!(starts[0], starts[1]);
}

#[tokio::test]
async fn failed_token_aborts_before_fetch() {
    let store = memory_store("2024-01-01T10:00:00Z");
    let mut h = Harness::new(SourceBehavior::Events(vec![]), store.clone());
    h.credentials = Arc::new(MockCredentials {
        fail: true,
        ..Default::default()
    });

    let report = h.orchestrator().run_at(ts("2024-01-01T11:00:00Z")).await;

    assert!(report.is_aborted());
    assert!(matches!(
        report.abort,
        Some(RunError::Auth(AuthError::Status { status: 401, .. }))
    ));
    assert!(report.window.is_none());
    assert!(h.source.starts().is_empty());
    assert_eq!(store.save_count(), 0);
}

#[tokio::test]
async fn hung_fetch_times_out_as_fetch_error() {
    let store = memory_store("2024-01-01T10:00:00Z");
    let mut h = Harness::new(SourceBehavior::Hang, store.clone());
    h.settings.fetch_timeout = Duration::from_millis(50);

    let report = h.orchestrator().run_at(ts("2024-01-01T11:00:00Z")).await;

    assert!(report.is_aborted());
    assert!(matches!(
        report.abort,
        Some(RunError::Fetch(FetchError::Timeout(50)))
    ));
    assert_eq!(store.save_count(), 0);
}

#[tokio::test]
async fn failed_save_is_soft() {
    let store = Arc::new(ReadOnlyStore {
        value: Watermark(ts("2024-01-01T10:00:00Z")),
    });
    let h = Harness::new(
        SourceBehavior::Events(vec![suspicious("alice@contoso.com", "Madrid")]),
        store,
    );

    let report = h.orchestrator().run_at(ts("2024-01-01T11:00:00Z")).await;

    assert_eq!(report.stage, RunStage::Done);
    assert!(report.notified);
    assert!(report.persisted.is_none());
    assert_eq!(report.soft_failures.len(), 1);
    assert!(matches!(
        report.soft_failures[0],
        RunError::Store(StoreError::Corrupt { .. })
    ));
}

#[tokio::test]
async fn watermark_never_decreases_across_runs() {
    let store = memory_store("2024-01-01T10:00:00Z");
    let h = Harness::new(SourceBehavior::Events(vec![]), store.clone());
    let orchestrator = h.orchestrator();

    orchestrator.run_at(ts("2024-01-01T11:00:00Z")).await;
    assert_eq!(store.get(), Some(Watermark(ts("2024-01-01T11:00:00Z"))));

    // Wall clock stepped back 90s, inside the skew tolerance.
    let report = orchestrator.run_at(ts("2024-01-01T10:58:30Z")).await;
    assert_eq!(report.stage, RunStage::Done);
    assert_eq!(store.get(), Some(Watermark(ts("2024-01-01T11:00:00Z"))));

    orchestrator.run_at(ts("2024-01-01T11:15:00Z")).await;
    assert_eq!(store.get(), Some(Watermark(ts("2024-01-01T11:15:00Z"))));
}

#[tokio::test]
async fn future_watermark_self_heals() {
    let store = memory_store("2024-01-01T12:10:00Z");
    let h = Harness::new(SourceBehavior::Events(vec![]), store.clone());

    let report = h.orchestrator().run_at(ts("2024-01-01T12:00:00Z")).await;

    let window = report.window.unwrap();
    assert!(window.reset);
    assert_eq!(window.base, ts("2024-01-01T11:00:00Z"));
    assert_eq!(h.source.starts(), vec![ts("2024-01-01T10:59:00Z")]);
    assert_eq!(store.get(), Some(Watermark(ts("2024-01-01T12:00:00Z"))));
}

#[tokio::test]
async fn missing_watermark_uses_lookback() {
    let store = Arc::new(MemoryWatermarkStore::new());
    let h = Harness::new(SourceBehavior::Events(vec![]), store.clone());

    h.orchestrator().run_at(ts("2024-01-01T12:00:30Z")).await;

    assert_eq!(h.source.starts(), vec![ts("2024-01-01T10:59:00Z")]);
    assert_eq!(store.get(), Some(Watermark(ts("2024-01-01T12:00:30Z"))));
}

#[tokio::test]
async fn dry_run_renders_but_neither_sends_nor_saves() {
    let store = memory_store("2024-01-01T10:00:00Z");
    let mut h = Harness::new(
        SourceBehavior::Events(vec![suspicious("alice@contoso.com", "Madrid")]),
        store.clone(),
    );
    h.settings.dry_run = true;

    let report = h.orchestrator().run_at(ts("2024-01-01T11:00:00Z")).await;

    assert_eq!(report.stage, RunStage::Done);
    assert_eq!(report.matched, 1);
    assert!(!report.notified);
    assert!(report.persisted.is_none());
    let preview = report.preview.expect("dry run keeps the rendered alert");
    assert_eq!(preview.subject, "[Alert] 1 suspicious sign-ins detected");
    assert_eq!(h.notifier.attempts.load(Ordering::SeqCst), 0);
    assert_eq!(store.save_count(), 0);
}

#[tokio::test]
async fn held_lease_aborts_at_start() {
    let dir = TempDir::new().unwrap();
    let file_store = FileWatermarkStore::new(dir.path().join("last_run.json"));
    file_store.save(Watermark(ts("2024-01-01T10:00:00Z"))).unwrap();
    let now = ts("2024-01-01T11:00:00Z");
    let _held = RunLease::acquire(file_store.lease_path(), Duration::from_secs(900), now).unwrap();

    let h = Harness::new(SourceBehavior::Events(vec![]), Arc::new(file_store.clone()));
    let report = h.orchestrator().run_at(now).await;

    assert!(report.is_aborted());
    assert!(matches!(report.abort, Some(RunError::Store(StoreError::Locked { .. }))));
    assert_eq!(h.credentials.calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        file_store.read().unwrap(),
        Some(Watermark(ts("2024-01-01T10:00:00Z")))
    );
}

#[tokio::test]
async fn lease_is_released_after_a_run() {
    let dir = TempDir::new().unwrap();
    let file_store = FileWatermarkStore::new(dir.path().join("last_run.json"));
    let h = Harness::new(SourceBehavior::Events(vec![]), Arc::new(file_store.clone()));
    let orchestrator = h.orchestrator();

    let first = orchestrator.run_at(ts("2024-01-01T11:00:00Z")).await;
    assert_eq!(first.stage, RunStage::Done);
    assert!(!file_store.lease_path().exists());

    let second = orchestrator.run_at(ts("2024-01-01T11:15:00Z")).await;
    assert_eq!(second.stage, RunStage::Done);
    assert_eq!(h.source.starts()[1], ts("2024-01-01T10:59:00Z"));
    assert_eq!(
        file_store.read().unwrap(),
        Some(Watermark(ts("2024-01-01T11:15:00Z")))
    );
}
