//! Resilient update client.
//!
//! [`UpdateClient::send`] delivers one state-change request with a bounded
//! number of retries. Each attempt runs under its own timeout; retries wait
//! `base * 2^attempt` with ±20% jitter. A response whose body carries
//! `"dedup": true` means the backend already applied the request and counts
//! as success whatever its status code.
//!
//! The client only moves bytes. It never touches the board or the idempotency
//! key store.

use packboard_runtime::metrics::UpdateMetrics;
use packboard_runtime::retry::{RetryPolicy, Sleeper, TokioSleeper, retry_with_predicate};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

/// HTTP method of a transport request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpMethod {
    /// `GET`
    Get,
    /// `POST` with a JSON body
    Post,
}

/// One request as handed to a [`Transport`].
#[derive(Clone, Debug, PartialEq)]
pub struct TransportRequest {
    /// Method
    pub method: HttpMethod,
    /// Absolute URL including any query string
    pub url: String,
    /// JSON body for `POST`
    pub body: Option<serde_json::Value>,
    /// Extra headers
    pub headers: Vec<(String, String)>,
}

impl TransportRequest {
    /// A `POST` of a JSON body.
    #[must_use]
    pub fn post(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            body: Some(body),
            headers: Vec::new(),
        }
    }

    /// A `GET`.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            body: None,
            headers: Vec::new(),
        }
    }

    /// Value of a header, matched case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Status and body of a completed HTTP exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status code
    pub status: u16,
    /// Raw response body
    pub body: String,
}

impl TransportResponse {
    /// A response with a JSON body.
    #[must_use]
    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        Self {
            status,
            body: body.to_string(),
        }
    }

    /// `true` for a 2xx status.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// `true` when the body reports the request as already applied.
    #[must_use]
    pub fn dedup(&self) -> bool {
        serde_json::from_str::<serde_json::Value>(&self.body)
            .ok()
            .and_then(|value| value.get("dedup").and_then(serde_json::Value::as_bool))
            .unwrap_or(false)
    }
}

/// Failure of a single attempt before any response arrived.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The attempt timed out or was aborted
    #[error("Request timed out")]
    Timeout,
    /// The connection could not be established or was reset
    #[error("Connection failed: {0}")]
    Connect(String),
    /// The request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    /// The response body could not be read
    #[error("Failed to read response: {0}")]
    Body(String),
}

impl TransportError {
    /// Everything but a request that could not be built is worth another attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Connect(_) | Self::Body(_))
    }
}

/// A single-attempt HTTP transport.
pub trait Transport: Send + Sync {
    /// Perform one exchange. Non-2xx statuses are responses, not errors.
    fn send(
        &self,
        request: TransportRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send + '_>>;
}

/// [`Transport`] backed by `reqwest`.
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Create a transport with a default client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport around an existing client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// A connection that is accepted and then dropped surfaces as a request error,
/// not a connect error, so both count as [`TransportError::Connect`].
fn classify(error: &reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_builder() || error.is_redirect() {
        TransportError::InvalidRequest(error.to_string())
    } else if error.is_body() || error.is_decode() {
        TransportError::Body(error.to_string())
    } else {
        TransportError::Connect(error.to_string())
    }
}

impl Transport for ReqwestTransport {
    fn send(
        &self,
        request: TransportRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send + '_>> {
        Box::pin(async move {
            let mut builder = match request.method {
                HttpMethod::Get => self.client.get(&request.url),
                HttpMethod::Post => self.client.post(&request.url),
            };
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await.map_err(|e| classify(&e))?;
            let status = response.status().as_u16();
            let body = response.text().await.map_err(|e| classify(&e))?;

            Ok(TransportResponse { status, body })
        })
    }
}

/// Externally triggered cancellation shared by clones.
#[derive(Clone, Debug)]
pub struct CancellationSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationSignal {
    /// A signal that has not fired.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Fire the signal. Firing twice is harmless.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// `true` once the signal has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolve when the signal fires.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Per-call options for [`UpdateClient::send`].
#[derive(Clone, Debug)]
pub struct SendOptions {
    /// Timeout of each attempt
    pub timeout: Duration,
    /// Retries after the first attempt
    pub max_retries: usize,
    /// Delay before the first retry; doubles each retry
    pub retry_delay_base: Duration,
    /// Extra request headers
    pub headers: Vec<(String, String)>,
    /// Cancels the whole call when fired
    pub cancel: Option<CancellationSignal>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_retries: 2,
            retry_delay_base: Duration::from_secs(1),
            headers: Vec::new(),
            cancel: None,
        }
    }
}

impl SendOptions {
    /// Add a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attach a cancellation signal.
    #[must_use]
    pub fn cancel_on(mut self, signal: CancellationSignal) -> Self {
        self.cancel = Some(signal);
        self
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.max_retries)
            .initial_delay(self.retry_delay_base)
            .max_delay(Duration::from_secs(300))
            .multiplier(2.0)
            .jitter(0.2)
            .build()
    }
}

/// Terminal failure of [`UpdateClient::send`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    /// An attempt exceeded its timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// The transport failed before a response arrived
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The backend answered with a failure status
    #[error("Backend returned HTTP {status}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },
    /// The caller cancelled the request
    #[error("Request cancelled")]
    Cancelled,
}

impl UpdateError {
    /// Whether another attempt may succeed.
    ///
    /// Server errors, `408` and `429` are retried; other client errors are not.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Transport(error) => error.is_retryable(),
            Self::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::Cancelled => false,
        }
    }
}

/// Retrying client over a [`Transport`].
#[derive(Clone)]
pub struct UpdateClient {
    transport: Arc<dyn Transport>,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for UpdateClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateClient").finish_non_exhaustive()
    }
}

impl UpdateClient {
    /// Create a client that sleeps with tokio timers between attempts.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_sleeper(transport, Arc::new(TokioSleeper))
    }

    /// Create a client with a custom backoff sleeper.
    #[must_use]
    pub fn with_sleeper(transport: Arc<dyn Transport>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { transport, sleeper }
    }

    /// POST `body` to `url`, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Cancelled`] if the signal fires (or had already
    /// fired), the first non-retryable error, or the last error once
    /// `max_retries` retries are used up.
    #[tracing::instrument(skip(self, body, options), fields(max_retries = options.max_retries))]
    pub async fn send(
        &self,
        url: &str,
        body: &serde_json::Value,
        options: &SendOptions,
    ) -> Result<TransportResponse, UpdateError> {
        let mut request = TransportRequest::post(url, body.clone());
        request.headers.clone_from(&options.headers);
        self.execute(request, options).await
    }

    /// Run any request through the retry loop.
    ///
    /// # Errors
    ///
    /// Same as [`UpdateClient::send`].
    pub async fn execute(
        &self,
        request: TransportRequest,
        options: &SendOptions,
    ) -> Result<TransportResponse, UpdateError> {
        let started = Instant::now();
        let policy = options.retry_policy();
        let attempts = AtomicUsize::new(0);

        let result = retry_with_predicate(
            &policy,
            self.sleeper.as_ref(),
            || {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed);
                self.attempt(attempt, request.clone(), options)
            },
            UpdateError::is_retryable,
        )
        .await;

        UpdateMetrics::record_duration(started.elapsed());
        match &result {
            Ok(response) if response.dedup() => {
                UpdateMetrics::record_dedup();
                tracing::debug!(status = response.status, "Backend reported request as already applied");
            },
            Ok(_) => {},
            Err(error) => {
                UpdateMetrics::record_failure();
                tracing::error!(
                    attempts = attempts.load(Ordering::Relaxed),
                    error = %error,
                    "Update failed"
                );
            },
        }
        result
    }

    async fn attempt(
        &self,
        attempt: usize,
        request: TransportRequest,
        options: &SendOptions,
    ) -> Result<TransportResponse, UpdateError> {
        if options.cancel.as_ref().is_some_and(CancellationSignal::is_cancelled) {
            return Err(UpdateError::Cancelled);
        }

        UpdateMetrics::record_attempt(attempt);
        tracing::trace!(attempt, url = %request.url, "Sending attempt");

        let call = tokio::time::timeout(options.timeout, self.transport.send(request));
        let outcome = match &options.cancel {
            Some(signal) => tokio::select! {
                outcome = call => outcome,
                () = signal.cancelled() => return Err(UpdateError::Cancelled),
            },
            None => call.await,
        };

        let response = match outcome {
            Err(_) => return Err(UpdateError::Timeout(options.timeout)),
            Ok(Err(error)) => return Err(UpdateError::Transport(error)),
            Ok(Ok(response)) => response,
        };

        if response.is_success() || response.dedup() {
            Ok(response)
        } else {
            Err(UpdateError::Status {
                status: response.status,
                body: response.body,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{Scripted, ScriptedTransport};
    use packboard_testing::RecordingSleeper;
    use serde_json::json;

    fn client(transport: &Arc<ScriptedTransport>) -> (UpdateClient, RecordingSleeper) {
        let sleeper = RecordingSleeper::new();
        let client = UpdateClient::with_sleeper(
            Arc::clone(transport) as Arc<dyn Transport>,
            Arc::new(sleeper.clone()),
        );
        (client, sleeper)
    }

    fn ok() -> Scripted {
        Scripted::Respond(TransportResponse::json(200, &json!({ "success": true })))
    }

    fn status(code: u16) -> Scripted {
        Scripted::Respond(TransportResponse::json(code, &json!({ "success": false })))
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok()]));
        let (client, sleeper) = client(&transport);

        let response = client
            .send("http://backend/update", &json!({ "action": "pack" }), &SendOptions::default())
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(transport.calls(), 1);
        assert!(sleeper.sleeps().is_empty());
        assert_eq!(transport.requests()[0].body, Some(json!({ "action": "pack" })));
    }

    #[tokio::test]
    async fn server_errors_are_retried_with_jittered_backoff() {
        let transport = Arc::new(ScriptedTransport::new(vec![status(503), status(502), ok()]));
        let (client, sleeper) = client(&transport);

        let response = client
            .send("http://backend/update", &json!({}), &SendOptions::default())
            .await
            .unwrap();

        assert!(response.is_success());
        assert_eq!(transport.calls(), 3);

        let sleeps = sleeper.sleeps();
        assert_eq!(sleeps.len(), 2);
        assert!(sleeps[0] >= Duration::from_millis(800) && sleeps[0] <= Duration::from_millis(1200));
        assert!(sleeps[1] >= Duration::from_millis(1600) && sleeps[1] <= Duration::from_millis(2400));
    }

    #[tokio::test]
    async fn exhausted_retries_return_last_error() {
        let transport = Arc::new(ScriptedTransport::new(vec![status(500), status(502), status(503)]));
        let (client, _) = client(&transport);

        let error = client
            .send("http://backend/update", &json!({}), &SendOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(error, UpdateError::Status { status: 503, .. }));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn client_errors_fail_immediately() {
        let transport = Arc::new(ScriptedTransport::new(vec![status(400), ok()]));
        let (client, sleeper) = client(&transport);

        let error = client
            .send("http://backend/update", &json!({}), &SendOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(error, UpdateError::Status { status: 400, .. }));
        assert!(!error.is_retryable());
        assert_eq!(transport.calls(), 1);
        assert!(sleeper.sleeps().is_empty());
    }

    #[tokio::test]
    async fn dedup_body_counts_as_success() {
        let transport = Arc::new(ScriptedTransport::new(vec![Scripted::Respond(
            TransportResponse::json(409, &json!({ "success": false, "dedup": true })),
        )]));
        let (client, _) = client(&transport);

        let response = client
            .send("http://backend/update", &json!({}), &SendOptions::default())
            .await
            .unwrap();

        assert!(response.dedup());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn connection_failures_retry_but_invalid_requests_do_not() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Scripted::Fail(TransportError::Connect("reset".into())),
            ok(),
        ]));
        let (first_client, _) = client(&transport);
        assert!(first_client.send("http://b/update", &json!({}), &SendOptions::default()).await.is_ok());
        assert_eq!(transport.calls(), 2);

        let transport = Arc::new(ScriptedTransport::new(vec![
            Scripted::Fail(TransportError::InvalidRequest("bad header".into())),
            ok(),
        ]));
        let (client, _) = client(&transport);
        let error = client
            .send("http://b/update", &json!({}), &SendOptions::default())
            .await
            .unwrap_err();
        assert_eq!(error, UpdateError::Transport(TransportError::InvalidRequest("bad header".into())));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn truncated_bodies_are_retried() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Scripted::Fail(TransportError::Body("connection closed before message completed".into())),
            Scripted::Fail(TransportError::Body("unexpected end of file".into())),
            ok(),
        ]));
        let (client, sleeper) = client(&transport);

        let response = client
            .send("http://b/update", &json!({}), &SendOptions::default())
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(transport.calls(), 3);
        assert_eq!(sleeper.sleeps().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_attempt_times_out_and_retries() {
        let transport = Arc::new(ScriptedTransport::new(vec![Scripted::Hang, ok()]));
        let (client, _) = client(&transport);
        let options = SendOptions {
            timeout: Duration::from_millis(500),
            ..SendOptions::default()
        };

        let response = client.send("http://b/update", &json!({}), &options).await.unwrap();

        assert!(response.is_success());
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn every_attempt_timing_out_surfaces_timeout() {
        let transport = Arc::new(ScriptedTransport::new(vec![Scripted::Hang, Scripted::Hang]));
        let (client, _) = client(&transport);
        let options = SendOptions {
            timeout: Duration::from_secs(1),
            max_retries: 1,
            ..SendOptions::default()
        };

        let error = client.send("http://b/update", &json!({}), &options).await.unwrap_err();

        assert_eq!(error, UpdateError::Timeout(Duration::from_secs(1)));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn pre_cancelled_signal_makes_no_attempt() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok()]));
        let (client, _) = client(&transport);
        let signal = CancellationSignal::new();
        signal.cancel();

        let error = client
            .send("http://b/update", &json!({}), &SendOptions::default().cancel_on(signal))
            .await
            .unwrap_err();

        assert_eq!(error, UpdateError::Cancelled);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_aborts_an_in_flight_attempt() {
        let transport = Arc::new(ScriptedTransport::new(vec![Scripted::Hang, ok()]));
        let (client, _) = client(&transport);
        let signal = CancellationSignal::new();
        let options = SendOptions::default().cancel_on(signal.clone());

        let pending = tokio::spawn(async move { client.send("http://b/update", &json!({}), &options).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.cancel();

        assert_eq!(pending.await.unwrap(), Err(UpdateError::Cancelled));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn headers_are_forwarded() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok()]));
        let (client, _) = client(&transport);

        client
            .send("http://b/update", &json!({}), &SendOptions::default().header("X-Request-Id", "abc"))
            .await
            .unwrap();

        assert_eq!(transport.requests()[0].header("x-request-id"), Some("abc"));
    }

    #[test]
    fn retryable_statuses() {
        let status = |status| UpdateError::Status { status, body: String::new() };
        assert!(status(500).is_retryable());
        assert!(status(408).is_retryable());
        assert!(status(429).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!UpdateError::Cancelled.is_retryable());
        assert!(UpdateError::Timeout(Duration::from_secs(1)).is_retryable());
    }
}
