//! Events that drive a session

use crate::action::ActionResult;
use crate::flow::{FlowOption, StepId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events that trigger state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    // Client events
    Answer {
        value: Value,
        /// Step the answer was given for; a mismatch is rejected as stale
        step: Option<StepId>,
    },
    /// `epoch` is set by the runtime's display timer, absent when a client
    /// skips ahead.
    AutoAdvance {
        epoch: Option<u64>,
    },
    ToolComplete {
        value: Option<Value>,
    },
    Retry,

    // Runtime events
    ActionSettled {
        invocation: u64,
        result: ActionResult,
    },
    OptionsResolved {
        epoch: u64,
        options: Vec<FlowOption>,
    },
}

impl Event {
    pub fn answer(value: impl Into<Value>) -> Self {
        Event::Answer {
            value: value.into(),
            step: None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::Answer { .. } => "ANSWER",
            Event::AutoAdvance { .. } => "AUTO_ADVANCE",
            Event::ToolComplete { .. } => "TOOL_COMPLETE",
            Event::Retry => "RETRY",
            Event::ActionSettled { .. } => "ACTION_SETTLED",
            Event::OptionsResolved { .. } => "OPTIONS_RESOLVED",
        }
    }
}

/// Wire form accepted from the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientEvent {
    Answer {
        #[serde(default)]
        value: Value,
        #[serde(default, alias = "stepId", skip_serializing_if = "Option::is_none")]
        step: Option<StepId>,
    },
    AutoAdvance,
    ToolComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
    Retry,
}

impl From<ClientEvent> for Event {
    fn from(event: ClientEvent) -> Self {
        match event {
            ClientEvent::Answer { value, step } => Event::Answer { value, step },
            ClientEvent::AutoAdvance => Event::AutoAdvance { epoch: None },
            ClientEvent::ToolComplete { value } => Event::ToolComplete { value },
            ClientEvent::Retry => Event::Retry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_event_wire_form() {
        let answer: ClientEvent = serde_json::from_value(json!({"type": "ANSWER", "value": "yes"})).unwrap();
        assert_eq!(Event::from(answer), Event::answer("yes"));

        let tool: ClientEvent = serde_json::from_value(json!({"type": "TOOL_COMPLETE"})).unwrap();
        assert_eq!(Event::from(tool), Event::ToolComplete { value: None });

        let skip: ClientEvent = serde_json::from_value(json!({"type": "AUTO_ADVANCE"})).unwrap();
        assert_eq!(Event::from(skip).name(), "AUTO_ADVANCE");

        assert!(serde_json::from_value::<ClientEvent>(json!({"type": "ACTION_SETTLED"})).is_err());
    }
}
