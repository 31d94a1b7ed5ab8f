//! Effects produced by state transitions

use crate::action::ActionDefinition;
use crate::flow::StepId;

/// Effects to be executed by the runtime after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// A step became current
    StepEntered {
        step: StepId,
        previous: Option<StepId>,
    },

    /// Run the step's entry action (spawns as a background task)
    InvokeAction {
        step: StepId,
        invocation: u64,
        action: ActionDefinition,
    },

    /// Abort an entry action that is still running
    CancelAction { invocation: u64 },

    /// Fire `AUTO_ADVANCE` once the message has been displayed
    ScheduleAutoAdvance { step: StepId, epoch: u64 },

    /// Notify clients that the entry action failed
    ActionFailed {
        step: StepId,
        error: String,
        retryable: bool,
    },

    /// A terminal step was reached
    Completed { step: StepId },
}

impl Effect {
    pub fn step_entered(step: &str, previous: Option<&str>) -> Self {
        Effect::StepEntered {
            step: step.to_string(),
            previous: previous.map(str::to_string),
        }
    }
}
