//! Session state types

use crate::flow::{FlowOption, StepId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

// ============================================================================
// Conversation Context
// ============================================================================

/// Everything the conversation has accumulated so far
///
/// Expressions, templates and actions see it through [`scope`](Self::scope).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationContext {
    pub responses: Map<String, Value>,
    pub tool_results: Map<String, Value>,
    pub errors: Map<String, Value>,
    pub current_step: StepId,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ConversationContext {
    pub fn new(initial_step: impl Into<StepId>, metadata: Map<String, Value>) -> Self {
        Self {
            responses: Map::new(),
            tool_results: Map::new(),
            errors: Map::new(),
            current_step: initial_step.into(),
            metadata,
        }
    }

    /// Read-only JSON view used for evaluation.
    pub fn scope(&self) -> Value {
        json!({
            "responses": self.responses,
            "toolResults": self.tool_results,
            "errors": self.errors,
            "metadata": self.metadata,
            "currentStep": self.current_step,
        })
    }

    /// Scope with the value being submitted exposed as `currentValue`.
    pub fn scope_with_value(&self, value: &Value) -> Value {
        let mut scope = self.scope();
        if let Value::Object(map) = &mut scope {
            map.insert("currentValue".to_string(), value.clone());
        }
        scope
    }

    pub fn record_response(&mut self, step: &str, value: Value) {
        self.responses.insert(step.to_string(), value);
    }

    pub fn record_tool_result(&mut self, step: &str, output: Value) {
        self.tool_results.insert(step.to_string(), output);
        self.errors.remove(step);
    }

    pub fn record_error(&mut self, step: &str, message: impl Into<String>) {
        self.errors
            .insert(step.to_string(), Value::String(message.into()));
    }

    pub fn error_for(&self, step: &str) -> Option<&str> {
        self.errors.get(step).and_then(Value::as_str)
    }
}

// ============================================================================
// Session State
// ============================================================================

/// Where the current step is in its lifecycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Phase {
    /// Waiting for an answer or a completion signal
    #[default]
    Ready,

    /// Entry action in flight; answers are not accepted
    ActionPending { invocation: u64 },

    /// Entry action failed; the step holds until retried or answered
    ActionFailed { error: String, retryable: bool },

    /// Reached a terminal step
    Completed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Phase::Ready => "ready",
            Phase::ActionPending { .. } => "action_pending",
            Phase::ActionFailed { .. } => "action_failed",
            Phase::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub context: ConversationContext,
    pub phase: Phase,
    /// Bumped on every step entry and action invocation; stale timers and
    /// action results carry an older value.
    pub epoch: u64,
    /// Dynamic options resolved for the current step visit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_options: Option<Vec<FlowOption>>,
}

impl SessionState {
    pub fn current_step(&self) -> &str {
        &self.context.current_step
    }

    pub fn is_completed(&self) -> bool {
        self.phase.is_terminal()
    }
}
