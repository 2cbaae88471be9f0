use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use browserid_common::error::{HelperError, TransportError};
use browserid_common::helper::{HelperGuardedClient, HelperStatus, ProxyHelper};
use browserid_common::http_client::HttpClient;
use browserid_verifier::verifier::VerifierOptions;
use browserid_verifier::{
    RemoteVerifierClient, Verified, VerifierDelegate, VerifierError, VerifierErrorKind,
};
use http::StatusCode;
use serde_json::{Value, json};
use tokio::sync::{Mutex, Notify};

type Handler = dyn Fn(&http::Request<Vec<u8>>) -> Result<http::Response<Vec<u8>>, TransportError>
    + Send
    + Sync;

#[derive(Clone)]
struct MockClient {
    handler: Arc<Handler>,
    log: Arc<Mutex<Vec<http::Request<Vec<u8>>>>>,
}

impl MockClient {
    fn new<F>(handler: F) -> Self
    where
        F: Fn(&http::Request<Vec<u8>>) -> Result<http::Response<Vec<u8>>, TransportError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            handler: Arc::new(handler),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Answers like a verifier: `expired-token` is rejected, anything else is
    /// accepted for the audience that was asked about.
    fn echo() -> Self {
        Self::new(|req| {
            let body: Value = serde_json::from_slice(req.body()).unwrap();
            let audience = body["audience"].as_str().unwrap().to_string();
            let reply = if body["assertion"] == "expired-token" {
                json!({"status": "failure", "reason": "assertion has expired"})
            } else {
                json!({
                    "status": "okay",
                    "email": "alice@example.org",
                    "audience": audience,
                    "expires": 1_700_000_000_000i64,
                    "issuer": "api.accounts.firefox.com",
                })
            };
            Ok(json_response(StatusCode::OK, &reply))
        })
    }

    async fn requests(&self) -> Vec<http::Request<Vec<u8>>> {
        std::mem::take(&mut *self.log.lock().await)
    }
}

impl HttpClient for MockClient {
    type Error = TransportError;
    fn send_http(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> impl core::future::Future<
        Output = core::result::Result<http::Response<Vec<u8>>, Self::Error>,
    > + Send {
        let log = self.log.clone();
        let handler = self.handler.clone();
        async move {
            // Yield so concurrent calls really interleave on the runtime.
            tokio::task::yield_now().await;
            let result = handler(&request);
            log.lock().await.push(request);
            result
        }
    }
}

#[derive(Clone)]
struct PanickingClient;

impl HttpClient for PanickingClient {
    type Error = TransportError;
    async fn send_http(
        &self,
        _request: http::Request<Vec<u8>>,
    ) -> Result<http::Response<Vec<u8>>, Self::Error> {
        panic!("transport blew up")
    }
}

/// Never answers.
#[derive(Clone)]
struct StalledClient;

impl HttpClient for StalledClient {
    type Error = TransportError;
    async fn send_http(
        &self,
        _request: http::Request<Vec<u8>>,
    ) -> Result<http::Response<Vec<u8>>, Self::Error> {
        std::future::pending().await
    }
}

fn json_response(status: StatusCode, body: &Value) -> http::Response<Vec<u8>> {
    http::Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(serde_json::to_vec(body).unwrap())
        .unwrap()
}

#[derive(Debug)]
enum Outcome {
    Success(Verified),
    Error(VerifierError),
}

/// Records every callback it receives so tests can count them.
struct RecordingDelegate {
    calls: Arc<std::sync::Mutex<Vec<Outcome>>>,
    done: Arc<Notify>,
}

impl VerifierDelegate for RecordingDelegate {
    fn handle_success(self, verified: Verified) {
        self.calls.lock().unwrap().push(Outcome::Success(verified));
        self.done.notify_one();
    }

    fn handle_error(self, error: VerifierError) {
        self.calls.lock().unwrap().push(Outcome::Error(error));
        self.done.notify_one();
    }
}

struct Recorder {
    calls: Arc<std::sync::Mutex<Vec<Outcome>>>,
    done: Arc<Notify>,
}

impl Recorder {
    fn new() -> Self {
        Self {
            calls: Arc::new(std::sync::Mutex::new(Vec::new())),
            done: Arc::new(Notify::new()),
        }
    }

    fn delegate(&self) -> RecordingDelegate {
        RecordingDelegate {
            calls: self.calls.clone(),
            done: self.done.clone(),
        }
    }

    /// Wait for the first callback, then give any stray second callback a
    /// chance to show up before returning everything recorded.
    async fn finish(self) -> Vec<Outcome> {
        tokio::time::timeout(Duration::from_secs(5), self.done.notified())
            .await
            .expect("delegate was never called");
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::mem::take(&mut *self.calls.lock().unwrap())
    }
}

fn verifier(http: MockClient) -> RemoteVerifierClient<MockClient> {
    RemoteVerifierClient::new(http, VerifierOptions::default())
}

#[tokio::test]
async fn valid_token_is_verified() {
    let http = MockClient::echo();
    let client = verifier(http.clone());
    let recorder = Recorder::new();

    client
        .verify("https://example.com", "valid-token-123", recorder.delegate())
        .unwrap();

    let calls = recorder.finish().await;
    assert_eq!(calls.len(), 1);
    match &calls[0] {
        Outcome::Success(verified) => {
            assert_eq!(verified.audience, "https://example.com");
            assert_eq!(verified.email.as_deref(), Some("alice@example.org"));
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn expired_token_is_rejected() {
    let client = verifier(MockClient::echo());
    let recorder = Recorder::new();

    client
        .verify("https://example.com", "expired-token", recorder.delegate())
        .unwrap();

    let calls = recorder.finish().await;
    assert_eq!(calls.len(), 1);
    match &calls[0] {
        Outcome::Error(err) => {
            assert_eq!(err.kind(), VerifierErrorKind::VerificationRejected);
            match err {
                VerifierError::Rejected(rejection) => {
                    assert_eq!(rejection.reason.as_deref(), Some("assertion has expired"))
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn connection_refused_is_a_transport_failure() {
    let http = MockClient::new(|_| Err(TransportError::Connect("connection refused".into())));
    let client = verifier(http.clone());
    let recorder = Recorder::new();

    client
        .verify("https://example.com", "valid-token-123", recorder.delegate())
        .unwrap();

    let calls = recorder.finish().await;
    assert_eq!(calls.len(), 1);
    match &calls[0] {
        Outcome::Error(err) => {
            assert_eq!(err.kind(), VerifierErrorKind::TransportFailure);
            assert!(matches!(
                err,
                VerifierError::Transport(TransportError::Connect(_))
            ));
        }
        other => panic!("unexpected: {other:?}"),
    }
    // One attempt, no retry.
    assert_eq!(http.requests().await.len(), 1);
}

#[tokio::test]
async fn timeout_is_a_transport_failure() {
    let http = MockClient::new(|_| Err(TransportError::Timeout));
    let client = verifier(http.clone());
    let recorder = Recorder::new();

    client
        .verify("https://example.com", "valid-token-123", recorder.delegate())
        .unwrap();

    let calls = recorder.finish().await;
    assert_eq!(calls.len(), 1);
    match &calls[0] {
        Outcome::Error(err) => {
            assert_eq!(err.kind(), VerifierErrorKind::TransportFailure);
            assert!(matches!(
                err,
                VerifierError::Transport(TransportError::Timeout)
            ));
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(http.requests().await.len(), 1);
}

#[tokio::test]
async fn empty_inputs_fail_synchronously_without_io() {
    let http = MockClient::echo();
    let client = verifier(http.clone());

    for (audience, assertion) in [("", "token"), ("https://example.com", ""), ("", "")] {
        let recorder = Recorder::new();
        let err = client
            .verify(audience, assertion, recorder.delegate())
            .unwrap_err();
        assert_eq!(err.kind(), VerifierErrorKind::InvalidArgument);
        assert!(recorder.calls.lock().unwrap().is_empty());
    }

    let err = client.verify_async("", "token").await.unwrap_err();
    assert!(matches!(err, VerifierError::InvalidArgument(_)));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(http.requests().await.is_empty());
}

#[tokio::test]
async fn sends_one_post_with_exact_body() {
    let http = MockClient::echo();
    let client = verifier(http.clone());

    let verified = client
        .verify_async("https://example.com", "valid-token-123")
        .await
        .unwrap();
    assert_eq!(verified.audience, "https://example.com");

    let requests = http.requests().await;
    assert_eq!(requests.len(), 1);
    let req = &requests[0];
    assert_eq!(req.method(), http::Method::POST);
    assert_eq!(
        req.uri().to_string(),
        "https://verifier.accounts.firefox.com/v2"
    );
    assert_eq!(req.headers()[http::header::CONTENT_TYPE], "application/json");
    let body: Value = serde_json::from_slice(req.body()).unwrap();
    assert_eq!(
        body,
        json!({"audience": "https://example.com", "assertion": "valid-token-123"})
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_are_independent() {
    let http = MockClient::echo();
    let client = verifier(http.clone());

    let assertions: Vec<String> = (0..16).map(|i| format!("token-{i}")).collect();
    let receivers: Vec<_> = assertions
        .iter()
        .enumerate()
        .map(|(i, assertion)| {
            client
                .verify_oneshot(&format!("https://site{i}.example"), assertion)
                .unwrap()
        })
        .collect();

    for (i, rx) in receivers.into_iter().enumerate() {
        let verified = rx.await.unwrap().unwrap();
        assert_eq!(verified.audience, format!("https://site{i}.example"));
    }

    let bodies: BTreeSet<(String, String)> = http
        .requests()
        .await
        .iter()
        .map(|req| {
            let body: Value = serde_json::from_slice(req.body()).unwrap();
            assert_eq!(body.as_object().unwrap().len(), 2);
            (
                body["audience"].as_str().unwrap().to_string(),
                body["assertion"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    let expected: BTreeSet<(String, String)> = assertions
        .iter()
        .enumerate()
        .map(|(i, a)| (format!("https://site{i}.example"), a.clone()))
        .collect();
    assert_eq!(bodies, expected);
}

#[tokio::test]
async fn panicking_transport_still_reports_once() {
    let client = RemoteVerifierClient::new(PanickingClient, VerifierOptions::default());
    let recorder = Recorder::new();

    client
        .verify("https://example.com", "valid-token-123", recorder.delegate())
        .unwrap();

    let calls = recorder.finish().await;
    assert_eq!(calls.len(), 1);
    match &calls[0] {
        Outcome::Error(err) => assert_eq!(err.kind(), VerifierErrorKind::TransportFailure),
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn runtime_shutdown_cancels_pending_verification_once() {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let client = RemoteVerifierClient::new(StalledClient, VerifierOptions::default());
    let recorder = Recorder::new();

    rt.block_on(async {
        client
            .verify("https://example.com", "valid-token-123", recorder.delegate())
            .unwrap();
    });
    drop(rt);

    let calls = std::mem::take(&mut *recorder.calls.lock().unwrap());
    assert_eq!(calls.len(), 1);
    match &calls[0] {
        Outcome::Error(err) => assert_eq!(err.kind(), VerifierErrorKind::TransportFailure),
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn runtime_shutdown_right_after_verify_still_reports_once() {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let client = verifier(MockClient::echo());
    let recorder = Recorder::new();

    rt.block_on(async {
        client
            .verify("https://example.com", "valid-token-123", recorder.delegate())
            .unwrap();
    });
    drop(rt);

    assert_eq!(recorder.calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn http_error_status_is_reported() {
    let http = MockClient::new(|_| {
        Ok(json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &json!({"error": "overloaded"}),
        ))
    });
    let client = verifier(http);

    let err = client
        .verify_async("https://example.com", "valid-token-123")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), VerifierErrorKind::TransportFailure);
    assert!(matches!(
        err,
        VerifierError::HttpStatus {
            status: StatusCode::SERVICE_UNAVAILABLE,
            ..
        }
    ));
}

#[tokio::test]
async fn audience_mismatch_is_rejected_unless_disabled() {
    let http = MockClient::new(|_| {
        Ok(json_response(
            StatusCode::OK,
            &json!({"status": "okay", "audience": "https://other.example", "email": "a@b.c"}),
        ))
    });

    let strict = verifier(http.clone());
    let err = strict
        .verify_async("https://example.com", "valid-token-123")
        .await
        .unwrap_err();
    assert!(matches!(err, VerifierError::AudienceMismatch { .. }));

    let lenient = verifier(http).with_validate_audience(false);
    let verified = lenient
        .verify_async("https://example.com", "valid-token-123")
        .await
        .unwrap();
    assert_eq!(verified.audience, "https://other.example");
}

#[tokio::test]
async fn oneshot_delivers_rejection() {
    let client = verifier(MockClient::echo());
    let rx = client
        .verify_oneshot("https://example.com", "expired-token")
        .unwrap();
    let err = rx.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), VerifierErrorKind::VerificationRejected);
}

struct MissingHelper;

impl ProxyHelper for MissingHelper {
    fn is_available(&self) -> bool {
        false
    }

    fn request_start(&self) -> Result<(), HelperError> {
        Err(HelperError::NotInstalled)
    }
}

struct RunningHelper;

impl ProxyHelper for RunningHelper {
    fn is_available(&self) -> bool {
        true
    }

    fn request_start(&self) -> Result<(), HelperError> {
        Ok(())
    }

    fn status(&self) -> HelperStatus {
        HelperStatus::On
    }
}

#[tokio::test]
async fn missing_proxy_helper_fails_before_sending() {
    let http = MockClient::echo();
    let guarded = HelperGuardedClient::new(http.clone(), Arc::new(MissingHelper));
    let client = RemoteVerifierClient::new(guarded, VerifierOptions::default());

    let rx = client
        .verify_oneshot("https://example.com", "valid-token-123")
        .unwrap();
    let err = rx.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), VerifierErrorKind::TransportFailure);
    assert!(http.requests().await.is_empty());
}

#[tokio::test]
async fn running_proxy_helper_lets_requests_through() {
    let http = MockClient::echo();
    let guarded = HelperGuardedClient::new(http.clone(), Arc::new(RunningHelper));
    let client = RemoteVerifierClient::new(guarded, VerifierOptions::default());

    let verified = client
        .verify_async("https://example.com", "valid-token-123")
        .await
        .unwrap();
    assert_eq!(verified.audience, "https://example.com");
    assert_eq!(http.requests().await.len(), 1);
}
