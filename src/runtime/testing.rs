//! Mock implementations for testing
//!
//! These mocks enable integration testing without real I/O.

use super::traits::ActionRunner;
use crate::action::{ActionContext, ActionDefinition, ActionResult, NavigationRequest, Navigator};
use crate::http::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use crate::options::OptionFunction;
use crate::storage::{MemoryStore, StorageScopes};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Mock Transport
// ============================================================================

enum Queued {
    Reply(Result<HttpResponse, TransportError>),
    /// Never answers; only a timeout or cancellation ends the request
    Hang,
}

/// HTTP transport that returns queued responses in order
#[allow(dead_code)]
#[derive(Default)]
pub struct MockTransport {
    responses: Mutex<VecDeque<Queued>>,
    /// Every request with the (possibly paused) clock time it was sent
    requests: Mutex<Vec<(Instant, HttpRequest)>>,
}

#[allow(dead_code)]
impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_response(&self, response: HttpResponse) {
        self.responses.lock().unwrap().push_back(Queued::Reply(Ok(response)));
    }

    pub fn queue_json(&self, status: u16, body: Value) {
        self.queue_response(HttpResponse { status, body });
    }

    pub fn queue_network_error(&self, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Queued::Reply(Err(TransportError::network(message))));
    }

    pub fn queue_hang(&self) {
        self.responses.lock().unwrap().push_back(Queued::Hang);
    }

    pub fn recorded_requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn request_times(&self) -> Vec<Instant> {
        self.requests.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push((Instant::now(), request));
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(Queued::Reply(reply)) => reply,
            Some(Queued::Hang) => std::future::pending().await,
            None => Err(TransportError::network("No mock response queued")),
        }
    }
}

// ============================================================================
// Mock Option Function
// ============================================================================

/// Option function that returns fixed items and counts its calls
#[allow(dead_code)]
pub struct CountingFunction {
    items: Vec<Value>,
    calls: AtomicUsize,
}

#[allow(dead_code)]
impl CountingFunction {
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            items,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OptionFunction for CountingFunction {
    async fn call(&self, _params: &Value, _scope: &Value) -> Result<Vec<Value>, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.items.clone())
    }
}

// ============================================================================
// Mock Navigator
// ============================================================================

/// Navigator that records requests, or refuses them all
#[allow(dead_code)]
#[derive(Default)]
pub struct RecordingNavigator {
    requests: Mutex<Vec<NavigationRequest>>,
    refusal: Option<String>,
}

#[allow(dead_code)]
impl RecordingNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refusing(reason: &str) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            refusal: Some(reason.to_string()),
        }
    }

    pub fn requests(&self) -> Vec<NavigationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, request: NavigationRequest) -> Result<(), String> {
        if let Some(reason) = &self.refusal {
            return Err(reason.clone());
        }
        self.requests.lock().unwrap().push(request);
        Ok(())
    }
}

// ============================================================================
// Mock Action Runner
// ============================================================================

/// Action runner with queued results
#[allow(dead_code)]
#[derive(Default)]
pub struct MockActionRunner {
    results: Mutex<VecDeque<ActionResult>>,
    invocations: Mutex<Vec<ActionDefinition>>,
    /// When set, every run waits for cancellation
    hang: AtomicBool,
    cancelled: AtomicUsize,
}

#[allow(dead_code)]
impl MockActionRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_result(&self, result: ActionResult) {
        self.results.lock().unwrap().push_back(result);
    }

    pub fn hang_until_cancelled(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    pub fn invocations(&self) -> Vec<ActionDefinition> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionRunner for MockActionRunner {
    async fn run(&self, action: &ActionDefinition, ctx: &ActionContext) -> ActionResult {
        self.invocations.lock().unwrap().push(action.clone());
        if self.hang.load(Ordering::SeqCst) {
            ctx.cancel.cancelled().await;
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            return ActionResult::cancelled();
        }
        let next = self.results.lock().unwrap().pop_front();
        next.unwrap_or_else(|| ActionResult::success(None))
    }
}

// ============================================================================
// Action contexts
// ============================================================================

/// Context over fresh in-memory stores with a recording navigator
#[allow(dead_code)]
pub fn action_context(scope: Value) -> ActionContext {
    action_context_with_navigator(scope, Arc::new(RecordingNavigator::new()))
}

#[allow(dead_code)]
pub fn action_context_with_navigator(scope: Value, navigator: Arc<RecordingNavigator>) -> ActionContext {
    ActionContext {
        cancel: CancellationToken::new(),
        session_id: "test-session".to_string(),
        scope,
        storage: StorageScopes::for_session(Arc::new(MemoryStore::new()), "test-client"),
        navigator,
    }
}
