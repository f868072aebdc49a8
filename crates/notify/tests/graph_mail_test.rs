//! HTTP-level tests for the Graph sendMail notifier.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use signwatch_notify::{GraphMailNotifier, Notification, Notifier, SendError};
use signwatch_source::{AccessToken, AuthError, CredentialProvider};

struct CountingToken {
    calls: Arc<AtomicUsize>,
    fail: bool,
}

#[async_trait::async_trait]
impl CredentialProvider for CountingToken {
    async fn acquire_token(&self) -> Result<AccessToken, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(AuthError::MissingToken)
        } else {
            Ok(AccessToken::new("mail-token", None))
        }
    }
}

fn notification() -> Notification {
    Notification {
        recipients: vec!["ops@contoso.com".to_string()],
        subject: "[Alert] 1 suspicious sign-ins detected".to_string(),
        body: "Suspicious sign-ins detected outside PT:\n\n- User: ...\n".to_string(),
    }
}

fn notifier(server: &MockServer, fail_token: bool) -> (GraphMailNotifier, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let credentials = Arc::new(CountingToken {
        calls: calls.clone(),
        fail: fail_token,
    });
    let notifier = GraphMailNotifier::new(
        &server.uri(),
        "alerts@contoso.com",
        credentials,
        Duration::from_secs(5),
    )
    .unwrap();
    (notifier, calls)
}

#[tokio::test]
async fn accepted_mail_is_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1.0/users/alerts@contoso.com/sendMail"))
        .and(header("authorization", "Bearer mail-token"))
        .and(body_partial_json(serde_json::json!({
            "message": {
                "subject": "[Alert] 1 suspicious sign-ins detected",
                "toRecipients": [ { "emailAddress": { "address": "ops@contoso.com" } } ]
            }
        })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let (notifier, calls) = notifier(&server, false);
    notifier.send(&notification()).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejected_mail_is_send_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("ErrorInvalidRecipients"))
        .mount(&server)
        .await;

    let (notifier, _) = notifier(&server, false);
    match notifier.send(&notification()).await {
        Err(SendError::Status { status, body }) => {
            assert_eq!(status, 400);
            assert_eq!(body, "ErrorInvalidRecipients");
        }
        other => panic!("expected Status error, got: {other:?}"),
    }
}

#[tokio::test]
async fn token_failure_is_send_error_without_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202))
        .expect(0)
        .mount(&server)
        .await;

    let (notifier, _) = notifier(&server, true);
    assert!(matches!(
        notifier.send(&notification()).await,
        Err(SendError::Auth(_))
    ));
}
