//! Pure state transition function
//!
//! Given the same machine, state and event, `transition` always produces the
//! same result and performs no I/O. Side effects are returned as [`Effect`]s
//! for the runtime to execute.

use super::builder::{CompiledCondition, CompiledOption, CompiledStep, Completion, Machine};
use super::{ConversationContext, Effect, Event, Phase, SessionState};
use crate::action::ActionResult;
use crate::expression::{sort_by_priority, strict_equals, Expression};
use crate::flow::{FlowOption, StepId};
use serde_json::{Map, Value};
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: SessionState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: SessionState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    #[must_use]
    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    #[must_use]
    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

/// The event was not accepted; the state is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Step \"{0}\" is not part of this flow")]
    UnknownStep(StepId),
    #[error("Conversation is complete")]
    Completed,
    #[error("Action for step \"{0}\" is still running")]
    ActionInFlight(StepId),
    #[error("No transition from \"{0}\" matches")]
    NoMatchingTransition(StepId),
    #[error("Step \"{0}\" does not advance automatically")]
    NoAutoAdvance(StepId),
    #[error("Step \"{0}\" is not awaiting completion")]
    NotAwaitingCompletion(StepId),
    #[error("Step \"{0}\" has no failed action to retry")]
    NothingToRetry(StepId),
    #[error("Stale {event} event, current step is \"{current}\"")]
    Stale { event: &'static str, current: StepId },
    #[error("Answer given for \"{answered}\" but the current step is \"{current}\"")]
    StepMismatch { answered: StepId, current: StepId },
}

impl TransitionError {
    /// Events that raced a step change; safe to drop silently.
    pub fn is_stale(&self) -> bool {
        matches!(self, TransitionError::Stale { .. } | TransitionError::StepMismatch { .. })
    }
}

impl Machine {
    /// Initial session state, plus the effects of entering the initial step.
    pub fn start(&self, metadata: Map<String, Value>) -> TransitionResult {
        let mut merged = self.metadata().clone();
        merged.extend(metadata);
        let state = SessionState {
            context: ConversationContext::new(self.initial_step(), merged),
            ..SessionState::default()
        };
        enter(self, state, self.initial_step(), None)
    }
}

/// Pure transition function
pub fn transition(
    machine: &Machine,
    state: &SessionState,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    let current = state.current_step();
    let step = machine
        .step(current)
        .ok_or_else(|| TransitionError::UnknownStep(current.to_string()))?;
    let stale = |event: &'static str| TransitionError::Stale {
        event,
        current: current.to_string(),
    };

    match (&state.phase, event) {
        // ============================================================
        // Runtime events
        // ============================================================
        (Phase::ActionPending { invocation }, Event::ActionSettled { invocation: settled, result })
            if *invocation == settled =>
        {
            Ok(settle_action(machine, step, state, result))
        }

        (_, Event::ActionSettled { .. }) => Err(stale("ACTION_SETTLED")),

        (phase, Event::OptionsResolved { epoch, options })
            if epoch == state.epoch && !phase.is_terminal() =>
        {
            let mut next = state.clone();
            next.resolved_options = Some(options);
            Ok(TransitionResult::new(next))
        }

        (_, Event::OptionsResolved { .. }) => Err(stale("OPTIONS_RESOLVED")),

        (_, Event::AutoAdvance { epoch: Some(epoch) }) if epoch != state.epoch => {
            Err(stale("AUTO_ADVANCE"))
        }

        (Phase::Completed, _) => Err(TransitionError::Completed),

        // ============================================================
        // Entry action in flight: only completion is accepted
        // ============================================================
        (Phase::ActionPending { .. }, Event::Answer { .. } | Event::AutoAdvance { .. } | Event::Retry) => {
            Err(TransitionError::ActionInFlight(step.id.clone()))
        }

        // ============================================================
        // Answers
        // ============================================================
        (_, Event::Answer { step: Some(answered), .. }) if answered != step.id => {
            Err(TransitionError::StepMismatch {
                answered,
                current: step.id.clone(),
            })
        }

        (_, Event::Answer { value, .. }) => {
            let target = resolve_answer(machine, step, state, &value)
                .ok_or_else(|| TransitionError::NoMatchingTransition(step.id.clone()))?;
            let mut next = state.clone();
            next.context.record_response(&step.id, value);
            Ok(move_to(machine, next, &target))
        }

        // ============================================================
        // Auto-advance
        // ============================================================
        (Phase::ActionFailed { .. }, Event::AutoAdvance { .. }) => {
            Err(TransitionError::NoAutoAdvance(step.id.clone()))
        }

        (_, Event::AutoAdvance { .. }) => match &step.auto_advance {
            Some(target) => Ok(move_to(machine, state.clone(), target)),
            None => Err(TransitionError::NoAutoAdvance(step.id.clone())),
        },

        // ============================================================
        // Completion signal
        // ============================================================
        (_, Event::ToolComplete { value }) => complete(machine, step, state, value),

        // ============================================================
        // Retry a failed entry action
        // ============================================================
        (Phase::ActionFailed { .. }, Event::Retry) => match &step.entry_action {
            Some(action) => {
                let mut next = state.clone();
                next.epoch += 1;
                next.context.errors.remove(&step.id);
                next.phase = Phase::ActionPending {
                    invocation: next.epoch,
                };
                let effect = Effect::InvokeAction {
                    step: step.id.clone(),
                    invocation: next.epoch,
                    action: action.clone(),
                };
                Ok(TransitionResult::new(next).with_effect(effect))
            }
            None => Err(TransitionError::NothingToRetry(step.id.clone())),
        },

        (_, Event::Retry) => Err(TransitionError::NothingToRetry(step.id.clone())),
    }
}

fn settle_action(
    machine: &Machine,
    step: &CompiledStep,
    state: &SessionState,
    result: ActionResult,
) -> TransitionResult {
    let mut next = state.clone();

    if !result.success {
        let error = result.error_message();
        next.context.record_error(&step.id, error.clone());
        next.phase = Phase::ActionFailed {
            error: error.clone(),
            retryable: result.retryable,
        };
        return TransitionResult::new(next).with_effect(Effect::ActionFailed {
            step: step.id.clone(),
            error,
            retryable: result.retryable,
        });
    }

    let output = result.output();
    next.context.record_tool_result(&step.id, output.clone());
    next.phase = Phase::Ready;

    match &step.completion {
        Completion::Target(target) => move_to(machine, next, target),
        Completion::RouteAnswer => match resolve_answer(machine, step, &next, &output) {
            Some(target) => {
                next.context.record_response(&step.id, output);
                move_to(machine, next, &target)
            }
            None => TransitionResult::new(next),
        },
        Completion::Hold => TransitionResult::new(next),
    }
}

fn complete(
    machine: &Machine,
    step: &CompiledStep,
    state: &SessionState,
    value: Option<Value>,
) -> Result<TransitionResult, TransitionError> {
    if !step.accepts_completion() {
        return Err(TransitionError::NotAwaitingCompletion(step.id.clone()));
    }

    let mut next = state.clone();
    if let Some(output) = &value {
        next.context.record_tool_result(&step.id, output.clone());
    }

    match &step.completion {
        Completion::Target(target) => Ok(move_to(machine, next, target)),
        Completion::RouteAnswer => {
            let routed = value.unwrap_or(Value::Null);
            let target = resolve_answer(machine, step, &next, &routed)
                .ok_or_else(|| TransitionError::NoMatchingTransition(step.id.clone()))?;
            next.context.record_response(&step.id, routed);
            Ok(move_to(machine, next, &target))
        }
        Completion::Hold => Err(TransitionError::NoMatchingTransition(step.id.clone())),
    }
}

/// First match wins: option conditions, option `nextStep`, step conditions,
/// then the default `nextStep`.
fn resolve_answer(
    machine: &Machine,
    step: &CompiledStep,
    state: &SessionState,
    value: &Value,
) -> Option<StepId> {
    let dynamic = state
        .resolved_options
        .as_deref()
        .map(|options| compile_resolved(machine, options))
        .unwrap_or_default();
    let chosen: Vec<&CompiledOption> = step
        .options
        .iter()
        .chain(dynamic.iter())
        .filter(|option| strict_equals(&option.value, value))
        .collect();

    let mut nested: Vec<&CompiledCondition> = chosen.iter().flat_map(|o| o.conditions.iter()).collect();
    sort_by_priority(&mut nested, |c| c.priority);
    let with_value = state.context.scope_with_value(value);
    if let Some(condition) = nested.iter().find(|c| c.matches(&with_value)) {
        return Some(condition.target.clone());
    }

    if let Some(target) = chosen.iter().find_map(|o| o.next_step.clone()) {
        return Some(target);
    }

    let scope = state.context.scope();
    if let Some(condition) = step.conditions.iter().find(|c| c.matches(&scope)) {
        return Some(condition.target.clone());
    }

    step.default_next.clone()
}

/// Options resolved at runtime carry their own edges; unknown targets and
/// unparsable guards are ignored.
fn compile_resolved(machine: &Machine, options: &[FlowOption]) -> Vec<CompiledOption> {
    let known = |target: &StepId| machine.contains(target).then(|| target.clone());
    options
        .iter()
        .map(|option| {
            let mut conditions: Vec<CompiledCondition> = option
                .conditions
                .iter()
                .filter_map(|c| {
                    Some(CompiledCondition {
                        guard: Expression::parse(&c.expression).ok(),
                        target: known(&c.target)?,
                        priority: c.priority,
                    })
                })
                .collect();
            sort_by_priority(&mut conditions, |c| c.priority);
            CompiledOption {
                value: option.value.clone(),
                next_step: option.next_step.as_ref().and_then(known),
                conditions,
            }
        })
        .collect()
}

fn move_to(machine: &Machine, state: SessionState, target: &str) -> TransitionResult {
    let cancel = match state.phase {
        Phase::ActionPending { invocation } => Some(Effect::CancelAction { invocation }),
        _ => None,
    };
    let previous = state.context.current_step.clone();
    let entered = enter(machine, state, target, Some(&previous));
    TransitionResult::new(entered.new_state).with_effects(cancel.into_iter().chain(entered.effects))
}

fn enter(machine: &Machine, mut state: SessionState, target: &str, previous: Option<&str>) -> TransitionResult {
    state.context.current_step = target.to_string();
    state.epoch += 1;
    state.resolved_options = None;
    state.phase = Phase::Ready;

    let mut effects = vec![Effect::step_entered(target, previous)];
    if let Some(step) = machine.step(target) {
        if step.terminal {
            state.phase = Phase::Completed;
            effects.push(Effect::Completed {
                step: target.to_string(),
            });
        } else if let Some(action) = &step.entry_action {
            state.phase = Phase::ActionPending {
                invocation: state.epoch,
            };
            effects.push(Effect::InvokeAction {
                step: target.to_string(),
                invocation: state.epoch,
                action: action.clone(),
            });
        } else if step.auto_advance.is_some() {
            effects.push(Effect::ScheduleAutoAdvance {
                step: target.to_string(),
                epoch: state.epoch,
            });
        }
    }

    TransitionResult::new(state).with_effects(effects)
}
