//! Runtime for executing sessions
//!
//! Each session runs on its own task, draining one event queue so that
//! exactly one transition is processed at a time. Entry actions and
//! auto-advance timers run as spawned tasks whose results come back through
//! the same queue.

mod executor;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use executor::SessionRuntime;
pub use traits::*;

use crate::action::{NavigationRequest, Navigator};
use crate::flow::StepId;
use crate::machine::{ConversationContext, Event, Machine, Phase, SessionState, TransitionError};
use crate::storage::{KeyValueStore, StorageScopes};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tokio_util::sync::CancellationToken;

const DEFAULT_AUTO_ADVANCE_MS: u64 = 1500;
const DEFAULT_COMPLETED_RETENTION_SECS: u64 = 600;

/// Metadata entry naming who owns a session's durable storage
pub const CLIENT_ID_KEY: &str = "clientId";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How long a message step stays on screen before advancing
    pub auto_advance_delay: Duration,
    /// How long a completed session stays readable before it is evicted
    pub completed_retention: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            auto_advance_delay: Duration::from_millis(DEFAULT_AUTO_ADVANCE_MS),
            completed_retention: Duration::from_secs(DEFAULT_COMPLETED_RETENTION_SECS),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session has shut down")]
    Closed,
    #[error("Step \"{0}\" is not part of this flow")]
    UnknownStep(StepId),
    #[error(transparent)]
    Rejected(#[from] TransitionError),
}

/// How the session loop handled an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Moved to another step (or re-entered the same one)
    Transitioned { from: StepId, to: StepId },
    /// Accepted without leaving the step
    Accepted,
    /// No transition matched; the step is unchanged
    Held { step: StepId },
    /// Raced a step change and was dropped
    Ignored,
}

/// Snapshot returned to the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub current_step_id: StepId,
    pub context: ConversationContext,
    pub pending_errors: Map<String, Value>,
    pub phase: Phase,
}

impl SessionSnapshot {
    pub fn new(session_id: &str, state: &SessionState) -> Self {
        Self {
            session_id: session_id.to_string(),
            current_step_id: state.current_step().to_string(),
            context: state.context.clone(),
            pending_errors: state.context.errors.clone(),
            phase: state.phase.clone(),
        }
    }
}

/// Updates pushed to stream subscribers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionUpdate {
    StepEntered {
        step: StepId,
        #[serde(skip_serializing_if = "Option::is_none")]
        previous: Option<StepId>,
    },
    OptionsLoading {
        step: StepId,
    },
    ActionFailed {
        step: StepId,
        error: String,
        retryable: bool,
    },
    Navigate(NavigationRequest),
    Completed {
        step: StepId,
    },
    StateChanged {
        snapshot: SessionSnapshot,
    },
}

impl SessionUpdate {
    /// SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            SessionUpdate::StepEntered { .. } => "step_entered",
            SessionUpdate::OptionsLoading { .. } => "options_loading",
            SessionUpdate::ActionFailed { .. } => "action_failed",
            SessionUpdate::Navigate(_) => "navigate",
            SessionUpdate::Completed { .. } => "completed",
            SessionUpdate::StateChanged { .. } => "state_changed",
        }
    }
}

/// Event plus an optional reply slot for callers that wait on the outcome
pub(crate) struct Envelope {
    pub event: Event,
    pub reply: Option<oneshot::Sender<Result<DispatchOutcome, TransitionError>>>,
}

/// Delivers `navigation` actions to stream subscribers
pub struct BroadcastNavigator {
    session_id: String,
    updates: broadcast::Sender<SessionUpdate>,
}

impl BroadcastNavigator {
    pub fn new(session_id: impl Into<String>, updates: broadcast::Sender<SessionUpdate>) -> Self {
        Self {
            session_id: session_id.into(),
            updates,
        }
    }
}

impl Navigator for BroadcastNavigator {
    fn navigate(&self, request: NavigationRequest) -> Result<(), String> {
        if self.updates.send(SessionUpdate::Navigate(request)).is_err() {
            tracing::debug!(session_id = %self.session_id, "Navigation requested with no subscribers");
        }
        Ok(())
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Handle to interact with a running session
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    machine: Arc<Machine>,
    event_tx: mpsc::Sender<Envelope>,
    state_rx: watch::Receiver<SessionState>,
    updates: broadcast::Sender<SessionUpdate>,
    shutdown: CancellationToken,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    /// Latest committed state
    pub fn state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot::new(&self.id, &self.state_rx.borrow())
    }

    /// Queue an event and wait for the loop to process it.
    pub async fn dispatch(&self, event: Event) -> Result<DispatchOutcome, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.event_tx
            .send(Envelope {
                event,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| SessionError::Closed)?;
        reply_rx
            .await
            .map_err(|_| SessionError::Closed)?
            .map_err(SessionError::from)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    /// Push an update that did not come from a transition.
    pub fn notify(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.event_tx.is_closed()
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Manager for all live sessions
pub struct SessionManager {
    runner: Arc<dyn ActionRunner>,
    durable: Arc<dyn KeyValueStore>,
    config: RuntimeConfig,
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl SessionManager {
    pub fn new(runner: Arc<dyn ActionRunner>, durable: Arc<dyn KeyValueStore>, config: RuntimeConfig) -> Self {
        Self {
            runner,
            durable,
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start a session on a compiled machine.
    ///
    /// Durable storage is keyed by the `clientId` metadata entry, or by the
    /// session id when the caller supplies none.
    pub async fn create(&self, machine: Arc<Machine>, metadata: Map<String, Value>) -> SessionHandle {
        let session_id = uuid::Uuid::new_v4().to_string();
        let owner = metadata
            .get(CLIENT_ID_KEY)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .unwrap_or(&session_id)
            .to_string();
        let started = machine.start(metadata);

        let (event_tx, event_rx) = mpsc::channel(32);
        let (updates, _) = broadcast::channel(128);
        let (state_tx, state_rx) = watch::channel(started.new_state.clone());
        let shutdown = CancellationToken::new();

        let mut runtime = SessionRuntime::new(
            session_id.clone(),
            machine.clone(),
            started.new_state,
            self.runner.clone(),
            StorageScopes::for_session(self.durable.clone(), &owner),
            Arc::new(BroadcastNavigator::new(session_id.clone(), updates.clone())),
            self.config.clone(),
            event_rx,
            event_tx.clone(),
            state_tx,
            updates.clone(),
            shutdown.clone(),
        );
        runtime.execute_effects(started.effects);

        let id = session_id.clone();
        tokio::spawn(async move {
            runtime.run().await;
            tracing::info!(session_id = %id, "Session runtime finished");
        });

        let handle = SessionHandle {
            id: session_id.clone(),
            machine,
            event_tx,
            state_rx,
            updates,
            shutdown,
        };
        self.sessions.write().await.insert(session_id.clone(), handle.clone());
        self.spawn_eviction(session_id, handle.state_rx.clone(), handle.shutdown.clone());
        handle
    }

    /// Forget the session once it has been completed for `completed_retention`.
    fn spawn_eviction(
        &self,
        session_id: String,
        mut state_rx: watch::Receiver<SessionState>,
        shutdown: CancellationToken,
    ) {
        let sessions = Arc::clone(&self.sessions);
        let retention = self.config.completed_retention;
        tokio::spawn(async move {
            let completed = async { state_rx.wait_for(SessionState::is_completed).await.is_ok() };
            tokio::select! {
                () = shutdown.cancelled() => return,
                completed = completed => if !completed { return },
            }
            tokio::select! {
                () = shutdown.cancelled() => {}
                () = tokio::time::sleep(retention) => {
                    sessions.write().await.remove(&session_id);
                    shutdown.cancel();
                    tracing::info!(session_id = %session_id, "Completed session evicted");
                }
            }
        });
    }

    pub async fn get(&self, session_id: &str) -> Result<SessionHandle, SessionError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Stop a session and forget it; in-flight actions are cancelled.
    pub async fn remove(&self, session_id: &str) -> Result<(), SessionError> {
        let handle = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        handle.shutdown();
        tracing::info!(session_id = %session_id, "Session removed");
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn shutdown_all(&self) {
        let sessions: Vec<SessionHandle> = self.sessions.write().await.drain().map(|(_, h)| h).collect();
        for handle in &sessions {
            handle.shutdown();
        }
        if !sessions.is_empty() {
            tracing::info!(count = sessions.len(), "Stopped all sessions");
        }
    }
}
