//! Session runtime executor

use super::traits::ActionRunner;
use super::{DispatchOutcome, Envelope, RuntimeConfig, SessionSnapshot, SessionUpdate};
use crate::action::{ActionContext, Navigator};
use crate::machine::{transition, Effect, Event, Machine, SessionState, TransitionError};
use crate::storage::StorageScopes;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Single-session event loop, generic over how entry actions are run
pub struct SessionRuntime<R>
where
    R: ActionRunner + ?Sized + 'static,
{
    session_id: String,
    machine: Arc<Machine>,
    state: SessionState,
    runner: Arc<R>,
    storage: StorageScopes,
    navigator: Arc<dyn Navigator>,
    config: RuntimeConfig,
    event_rx: mpsc::Receiver<Envelope>,
    event_tx: mpsc::Sender<Envelope>,
    state_tx: watch::Sender<SessionState>,
    broadcast_tx: broadcast::Sender<SessionUpdate>,
    shutdown: CancellationToken,
    /// Invocation and token of the entry action in flight
    action_cancel: Option<(u64, CancellationToken)>,
}

impl<R> SessionRuntime<R>
where
    R: ActionRunner + ?Sized + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session_id: String,
        machine: Arc<Machine>,
        state: SessionState,
        runner: Arc<R>,
        storage: StorageScopes,
        navigator: Arc<dyn Navigator>,
        config: RuntimeConfig,
        event_rx: mpsc::Receiver<Envelope>,
        event_tx: mpsc::Sender<Envelope>,
        state_tx: watch::Sender<SessionState>,
        broadcast_tx: broadcast::Sender<SessionUpdate>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            machine,
            state,
            runner,
            storage,
            navigator,
            config,
            event_rx,
            event_tx,
            state_tx,
            broadcast_tx,
            shutdown,
            action_cancel: None,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(session_id = %self.session_id, step = %self.state.current_step(), "Starting session runtime");

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => break,

                Some(envelope) = self.event_rx.recv() => {
                    let outcome = self.process_event(envelope.event);
                    if let Some(reply) = envelope.reply {
                        let _ = reply.send(outcome);
                    }
                }

                else => break,
            }
        }

        if let Some((invocation, token)) = self.action_cancel.take() {
            tracing::debug!(session_id = %self.session_id, invocation, "Cancelling action on shutdown");
            token.cancel();
        }
        tracing::info!(session_id = %self.session_id, "Session runtime stopped");
    }

    fn process_event(&mut self, event: Event) -> Result<DispatchOutcome, TransitionError> {
        let name = event.name();
        let from = self.state.current_step().to_string();

        let result = match transition(&self.machine, &self.state, event) {
            Ok(r) => r,
            Err(e) if e.is_stale() => {
                tracing::debug!(session_id = %self.session_id, event = name, error = %e, "Dropping stale event");
                return Ok(DispatchOutcome::Ignored);
            }
            Err(TransitionError::NoMatchingTransition(step)) => {
                tracing::debug!(session_id = %self.session_id, step = %step, "No transition matched, holding");
                return Ok(DispatchOutcome::Held { step });
            }
            Err(e) => {
                tracing::debug!(session_id = %self.session_id, event = name, error = %e, "Event rejected");
                return Err(e);
            }
        };

        let entered = result
            .effects
            .iter()
            .any(|e| matches!(e, Effect::StepEntered { .. }));
        self.state = result.new_state;
        self.state_tx.send_replace(self.state.clone());

        self.execute_effects(result.effects);
        let _ = self.broadcast_tx.send(SessionUpdate::StateChanged {
            snapshot: SessionSnapshot::new(&self.session_id, &self.state),
        });

        Ok(if entered {
            DispatchOutcome::Transitioned {
                from,
                to: self.state.current_step().to_string(),
            }
        } else {
            DispatchOutcome::Accepted
        })
    }

    pub(crate) fn execute_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            self.execute_effect(effect);
        }
    }

    /// Effects never block the loop; anything slow is spawned and reports
    /// back through the event queue.
    fn execute_effect(&mut self, effect: Effect) {
        match effect {
            Effect::StepEntered { step, previous } => {
                tracing::info!(session_id = %self.session_id, step = %step, previous = ?previous, "Entered step");
                let _ = self.broadcast_tx.send(SessionUpdate::StepEntered { step, previous });
            }

            Effect::InvokeAction {
                step,
                invocation,
                action,
            } => {
                let cancel = self.shutdown.child_token();
                if let Some((_, previous)) = self.action_cancel.replace((invocation, cancel.clone())) {
                    previous.cancel();
                }

                let ctx = ActionContext {
                    cancel: cancel.clone(),
                    session_id: self.session_id.clone(),
                    scope: self.state.context.scope(),
                    storage: self.storage.clone(),
                    navigator: self.navigator.clone(),
                };
                let runner = self.runner.clone();
                let event_tx = self.event_tx.clone();
                let session_id = self.session_id.clone();

                tracing::info!(session_id = %session_id, step = %step, kind = %action.kind, invocation, "Invoking entry action");
                tokio::spawn(async move {
                    let result = runner.run(&action, &ctx).await;
                    if cancel.is_cancelled() {
                        tracing::debug!(session_id = %session_id, step = %step, invocation, "Action finished after cancellation");
                        return;
                    }
                    if !result.success {
                        tracing::warn!(session_id = %session_id, step = %step, error = %result.error_message(), "Entry action failed");
                    }
                    let _ = event_tx
                        .send(Envelope {
                            event: Event::ActionSettled { invocation, result },
                            reply: None,
                        })
                        .await;
                });
            }

            Effect::CancelAction { invocation } => match self.action_cancel.take() {
                Some((running, token)) if running == invocation => {
                    tracing::debug!(session_id = %self.session_id, invocation, "Cancelling entry action");
                    token.cancel();
                }
                other => self.action_cancel = other,
            },

            Effect::ScheduleAutoAdvance { step, epoch } => {
                let delay = self.config.auto_advance_delay;
                let shutdown = self.shutdown.clone();
                let event_tx = self.event_tx.clone();
                tracing::debug!(session_id = %self.session_id, step = %step, delay_ms = delay.as_millis(), "Scheduling auto-advance");
                tokio::spawn(async move {
                    tokio::select! {
                        () = shutdown.cancelled() => {}
                        () = tokio::time::sleep(delay) => {
                            let _ = event_tx
                                .send(Envelope {
                                    event: Event::AutoAdvance { epoch: Some(epoch) },
                                    reply: None,
                                })
                                .await;
                        }
                    }
                });
            }

            Effect::ActionFailed {
                step,
                error,
                retryable,
            } => {
                self.action_cancel = None;
                let _ = self.broadcast_tx.send(SessionUpdate::ActionFailed {
                    step,
                    error,
                    retryable,
                });
            }

            Effect::Completed { step } => {
                tracing::info!(session_id = %self.session_id, step = %step, "Session completed");
                let _ = self.broadcast_tx.send(SessionUpdate::Completed { step });
            }
        }
    }
}
