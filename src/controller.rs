//! Conversation controller
//!
//! Session-facing surface for the presentation layer: renders the input for
//! the current step, normalizes and validates answers before they reach the
//! machine, and shows validation and action errors.

mod inputs;

pub use inputs::{builtin_input_handlers, format_yen};

use crate::expression::render_message;
use crate::flow::{FlowOption, SliderConfig, StepCapabilities, StepDefinition, StepId};
use crate::machine::{ClientEvent, Event, Phase};
use crate::options::OptionLoader;
use crate::registry::Registry;
use crate::runtime::{DispatchOutcome, SessionError, SessionHandle, SessionUpdate};
use crate::validation::{validate_value_with, ValidationError, ValidationRule};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Renders and checks input for one step kind
pub trait InputHandler: Send + Sync {
    fn kind(&self) -> &str;

    /// Used when the kind is not built in
    fn capabilities(&self) -> StepCapabilities;

    fn render(&self, step: &StepDefinition, options: &[FlowOption]) -> Widget;

    /// Convert raw input to the value the flow routes on; `Err` is shown to
    /// the user as-is.
    fn normalize(&self, _step: &StepDefinition, raw: Value) -> Result<Value, String> {
        Ok(raw)
    }

    /// Rules implied by presentation hints, checked before declared rules
    fn implicit_rules(&self, _step: &StepDefinition) -> Vec<ValidationRule> {
        Vec::new()
    }
}

/// A selectable answer as shown to the user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Choice {
    pub value: Value,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Choice {
    pub fn from_option(option: &FlowOption) -> Self {
        Self {
            value: option.value.clone(),
            label: option.display_label(),
            metadata: option.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "widget", rename_all = "snake_case")]
pub enum Widget {
    None,
    Buttons {
        choices: Vec<Choice>,
    },
    Cards {
        choices: Vec<Choice>,
    },
    Text {
        #[serde(skip_serializing_if = "Option::is_none")]
        placeholder: Option<String>,
    },
    Amount {
        #[serde(skip_serializing_if = "Option::is_none")]
        placeholder: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
        presets: Vec<Choice>,
    },
    Number {
        #[serde(skip_serializing_if = "Option::is_none")]
        placeholder: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    Slider(SliderConfig),
    /// Waiting on an action or an external completion signal
    Progress,
}

/// Everything needed to draw the current step
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputSurface {
    pub step_id: StepId,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub widget: Widget,
    /// Action failure recorded for this step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retryable: bool,
    pub phase: Phase,
}

/// What happened to a submitted answer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Submission {
    /// Reached the machine
    Accepted { outcome: DispatchOutcome },
    /// Stopped before the machine; the step is unchanged
    Invalid { errors: Vec<ValidationError> },
}

pub struct ConversationController {
    session: SessionHandle,
    registry: Arc<Registry>,
    loader: Arc<OptionLoader>,
}

impl ConversationController {
    pub fn new(session: SessionHandle, registry: Arc<Registry>, loader: Arc<OptionLoader>) -> Self {
        Self {
            session,
            registry,
            loader,
        }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Input surface for the current step. Dynamic options are resolved
    /// first, at most once per step visit.
    pub async fn surface(&self) -> Result<InputSurface, SessionError> {
        let state = self.session.state();
        let machine = self.session.machine();
        let step_id = state.current_step().to_string();
        let step = machine
            .step(&step_id)
            .ok_or_else(|| SessionError::UnknownStep(step_id.clone()))?;
        let definition = &step.definition;

        let options = match (definition.dynamic_source(), &state.resolved_options) {
            (Some(_), Some(resolved)) => resolved.clone(),
            (Some(config), None) if !state.phase.is_terminal() => {
                self.session.notify(SessionUpdate::OptionsLoading { step: step_id.clone() });
                let loaded = self.loader.load_options(config, &state.context.scope()).await;
                tracing::debug!(session_id = %self.session.id(), step = %step_id, count = loaded.len(), "Dynamic options resolved");
                self.session
                    .dispatch(Event::OptionsResolved {
                        epoch: state.epoch,
                        options: loaded.clone(),
                    })
                    .await?;
                loaded
            }
            _ => definition.static_options().to_vec(),
        };

        let widget = match self.registry.input_handler(step.kind().as_str()) {
            Some(handler) => handler.render(definition, &options),
            None => fallback_widget(step.capabilities, &options),
        };
        let (error, retryable) = match &state.phase {
            Phase::ActionFailed { error, retryable } => (Some(error.clone()), *retryable),
            _ => (state.context.error_for(&step_id).map(str::to_string), false),
        };

        Ok(InputSurface {
            kind: step.kind().to_string(),
            message: definition
                .message
                .as_deref()
                .map(|m| render_message(m, &state.context.scope())),
            widget,
            error,
            retryable,
            phase: state.phase.clone(),
            step_id,
        })
    }

    /// Normalize, validate, then forward as an `ANSWER` for the current step.
    pub async fn submit_answer(&self, raw: Value) -> Result<Submission, SessionError> {
        let current = self.session.state().current_step().to_string();
        self.submit_answer_for(raw, current).await
    }

    async fn submit_answer_for(&self, raw: Value, step_id: StepId) -> Result<Submission, SessionError> {
        let state = self.session.state();
        let machine = self.session.machine();
        // Answers for a step already left go straight to the machine, which
        // drops them.
        let Some(step) = machine.step(&step_id).filter(|_| step_id == state.current_step()) else {
            let outcome = self
                .session
                .dispatch(Event::Answer {
                    value: raw,
                    step: Some(step_id),
                })
                .await?;
            return Ok(Submission::Accepted { outcome });
        };
        let definition = &step.definition;
        let handler = self.registry.input_handler(step.kind().as_str());

        let value = match &handler {
            Some(handler) => match handler.normalize(definition, raw) {
                Ok(value) => value,
                Err(message) => {
                    return Ok(Submission::Invalid {
                        errors: vec![ValidationError {
                            field: Some(step_id),
                            message,
                            code: "format".to_string(),
                        }],
                    })
                }
            },
            None => raw,
        };

        let mut rules = Vec::new();
        if !is_blank(&value) {
            rules.extend(handler.iter().flat_map(|h| h.implicit_rules(definition)));
        }
        rules.extend(definition.validation.iter().cloned());
        if !rules.is_empty() {
            let scope = state.context.scope_with_value(&value);
            let result = validate_value_with(&value, &rules, Some(&scope), self.registry.validators());
            if !result.valid {
                tracing::debug!(session_id = %self.session.id(), step = %step_id, errors = result.errors.len(), "Answer failed validation");
                let errors = result
                    .errors
                    .into_iter()
                    .map(|mut e| {
                        e.field = Some(step_id.clone());
                        e
                    })
                    .collect();
                return Ok(Submission::Invalid { errors });
            }
        }

        let outcome = self
            .session
            .dispatch(Event::Answer {
                value,
                step: Some(step_id),
            })
            .await?;
        Ok(Submission::Accepted { outcome })
    }

    /// Entry point for wire events; answers are validated first.
    pub async fn send(&self, event: ClientEvent) -> Result<Submission, SessionError> {
        match event {
            ClientEvent::Answer { value, step: Some(step) } => self.submit_answer_for(value, step).await,
            ClientEvent::Answer { value, step: None } => self.submit_answer(value).await,
            other => {
                let outcome = self.session.dispatch(other.into()).await?;
                Ok(Submission::Accepted { outcome })
            }
        }
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Kinds with no registered handler
fn fallback_widget(capabilities: StepCapabilities, options: &[FlowOption]) -> Widget {
    if !options.is_empty() {
        Widget::Buttons {
            choices: options.iter().map(Choice::from_option).collect(),
        }
    } else if capabilities.produces_value {
        Widget::Text { placeholder: None }
    } else if capabilities.awaits_completion {
        Widget::Progress
    } else {
        Widget::None
    }
}
