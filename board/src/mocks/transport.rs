//! Mock transports.

use crate::client::{HttpMethod, Transport, TransportError, TransportRequest, TransportResponse};
use serde_json::{Value, json};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

/// One scripted outcome of [`ScriptedTransport`].
#[derive(Clone, Debug)]
pub enum Scripted {
    /// Answer with this response
    Respond(TransportResponse),
    /// Fail with this error
    Fail(TransportError),
    /// Never answer
    Hang,
}

/// Transport that plays back a fixed script, one entry per call, and records
/// every request. Calls past the end of the script fail to connect.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<TransportRequest>>,
}

impl ScriptedTransport {
    /// Create a transport playing `script` in order.
    #[must_use]
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Append an outcome.
    pub fn push(&self, outcome: Scripted) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(outcome);
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Transport for ScriptedTransport {
    fn send(
        &self,
        request: TransportRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send + '_>> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        Box::pin(async move {
            match next {
                Some(Scripted::Respond(response)) => Ok(response),
                Some(Scripted::Fail(error)) => Err(error),
                Some(Scripted::Hang) => std::future::pending().await,
                None => Err(TransportError::Connect("script exhausted".to_string())),
            }
        })
    }
}

#[derive(Debug, Default)]
struct SimulatedState {
    search_body: Value,
    applied: HashSet<String>,
    effective_updates: usize,
    responses_to_drop: usize,
    requests: Vec<TransportRequest>,
}

/// Transport that behaves like the HTTP backend: `GET …/search` returns a
/// canned body and `POST …/update` applies each request id once, answering
/// `dedup` for repeats.
///
/// [`SimulatedBackendTransport::drop_next_responses`] makes updates apply and
/// then lose their response, which is how a retry ends up resubmitting an id
/// the backend already applied.
#[derive(Debug, Default)]
pub struct SimulatedBackendTransport {
    state: Mutex<SimulatedState>,
}

impl SimulatedBackendTransport {
    /// Create a backend answering searches with `search_body`.
    #[must_use]
    pub fn new(search_body: Value) -> Self {
        Self {
            state: Mutex::new(SimulatedState {
                search_body,
                ..SimulatedState::default()
            }),
        }
    }

    /// Apply the next `count` updates but time out instead of answering.
    pub fn drop_next_responses(&self, count: usize) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .responses_to_drop = count;
    }

    /// Updates that changed state, excluding deduplicated repeats.
    #[must_use]
    pub fn effective_updates(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .effective_updates
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<TransportRequest> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .requests
            .clone()
    }

    fn answer(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.requests.push(request.clone());

        match request.method {
            HttpMethod::Get if request.url.contains("/search") => {
                Ok(TransportResponse::json(200, &state.search_body))
            },
            HttpMethod::Post if request.url.ends_with("/update") => {
                let request_id = request
                    .header("X-Request-Id")
                    .map(str::to_string)
                    .or_else(|| {
                        request
                            .body
                            .as_ref()
                            .and_then(|body| body.get("requestId"))
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    });
                let Some(request_id) = request_id else {
                    return Ok(TransportResponse::json(
                        400,
                        &json!({ "success": false, "error": "missing requestId" }),
                    ));
                };

                if !state.applied.insert(request_id) {
                    return Ok(TransportResponse::json(200, &json!({ "success": true, "dedup": true })));
                }
                state.effective_updates += 1;

                if state.responses_to_drop > 0 {
                    state.responses_to_drop -= 1;
                    return Err(TransportError::Timeout);
                }
                Ok(TransportResponse::json(200, &json!({ "success": true })))
            },
            _ => Ok(TransportResponse::json(404, &json!({ "success": false, "error": "not found" }))),
        }
    }
}

impl Transport for SimulatedBackendTransport {
    fn send(
        &self,
        request: TransportRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send + '_>> {
        let outcome = self.answer(request);
        Box::pin(async move { outcome })
    }
}
